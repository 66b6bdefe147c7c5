//! Timer sweep.
//!
//! The engine never sleeps; a scheduler calls [`Engine::sweep_timeouts`]
//! periodically. Each timer transition goes through the same conditional
//! claims as the interactive paths, so overlapping sweeps are harmless.

use tracing::{debug, info, warn};

use chant_core::error::ChantError;
use chant_core::store::{Condition, Write};
use chant_core::types::{CellStatus, Deliberation, Phase};

use crate::assignment::voting_deadline;
use crate::cell_result::CellOutcome;
use crate::engine::Engine;

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Cells whose discussion window ended.
    pub voting_opened: usize,
    pub cells_timed_out: usize,
    /// Cells that hit their deadline with no votes and got their one extension.
    pub cells_extended: usize,
    pub accumulations_closed: usize,
    /// Deliberations whose sweep failed; logged and retried on the next sweep.
    pub errors: usize,
}

impl Engine {
    /// Apply every timer that expired at or before `now`.
    pub fn sweep_timeouts(&self, now: u64) -> Result<SweepReport, ChantError> {
        let mut report = SweepReport::default();
        for id in self.store().deliberation_ids()? {
            let Some(delib) = self.store().deliberation(&id)? else {
                continue;
            };
            if let Err(e) = self.sweep_deliberation(&delib, now, &mut report) {
                warn!(deliberation = %id, error = %e, "sweep failed");
                report.errors += 1;
            }
        }
        if report != SweepReport::default() {
            info!(?report, "timeout sweep");
        }
        Ok(report)
    }

    fn sweep_deliberation(
        &self,
        delib: &Deliberation,
        now: u64,
        report: &mut SweepReport,
    ) -> Result<(), ChantError> {
        match delib.phase {
            Phase::Voting => {}
            Phase::Accumulating => {
                if delib.accumulation_ends_at.is_some_and(|at| at <= now) {
                    let outcome = self.start_challenge_round(delib.id)?;
                    debug!(deliberation = %delib.id, ?outcome, "accumulation window closed");
                    report.accumulations_closed += 1;
                }
                return Ok(());
            }
            Phase::Submission | Phase::Completed => return Ok(()),
        }

        for cell in self.store().cells(&delib.id)? {
            match cell.status {
                CellStatus::Deliberating if cell.discussion_ends_at.is_some_and(|at| at <= now) => {
                    let mut voting = cell.clone();
                    voting.set_status(CellStatus::Voting)?;
                    voting.voting_deadline = voting_deadline(delib, now);
                    let guard = [Condition::CellStatusIs {
                        id: cell.id,
                        status: CellStatus::Deliberating,
                    }];
                    if self.store().commit_if(&guard, Write::Cell(voting).into())? {
                        debug!(cell = %cell.id, "discussion over, voting open");
                        report.voting_opened += 1;
                    }
                }
                CellStatus::Voting if cell.voting_deadline.is_some_and(|at| at <= now) => {
                    match self.process_cell_at(cell.id, true, now)? {
                        CellOutcome::AlreadyHandled => {}
                        CellOutcome::Extended { .. } => report.cells_extended += 1,
                        _ => report.cells_timed_out += 1,
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fcfs, user, Harness};
    use chant_core::types::DeliberationSettings;

    #[test]
    fn nothing_due_does_nothing() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 3);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        let report = h.engine.sweep_timeouts(h.advance(10)).unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn discussion_window_opens_voting() {
        let h = Harness::new();
        let settings = DeliberationSettings {
            discussion_duration_ms: Some(5_000),
            ..fcfs(3)
        };
        let d = h.deliberation(settings, 3);
        let ideas = h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        let seat = h.engine.enter_cell(d.id, user(0)).unwrap();
        let err = h
            .engine
            .cast_vote(seat.cell, user(0), &[(ideas[0].id, 10)])
            .unwrap_err();
        assert_eq!(err.code(), Some("VOTING_NOT_OPEN"));

        let report = h.engine.sweep_timeouts(h.advance(5_000)).unwrap();
        assert_eq!(report.voting_opened, 1);
        let cell = h.engine.store().cell(&seat.cell).unwrap().unwrap();
        assert_eq!(cell.status, CellStatus::Voting);
        assert!(cell.voting_deadline.is_some());
        h.engine
            .cast_vote(seat.cell, user(0), &[(ideas[0].id, 10)])
            .unwrap();
    }

    #[test]
    fn silent_cell_is_extended_then_closed() {
        let h = Harness::new();
        let settings = DeliberationSettings {
            voting_timeout_ms: 1_000,
            ..fcfs(3)
        };
        let d = h.deliberation(settings, 3);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();

        let report = h.engine.sweep_timeouts(h.advance(1_000)).unwrap();
        assert_eq!(report.cells_extended, 1);
        assert_eq!(report.cells_timed_out, 0);

        let report = h.engine.sweep_timeouts(h.advance(500)).unwrap();
        assert_eq!(report, SweepReport::default());

        let report = h.engine.sweep_timeouts(h.advance(500)).unwrap();
        assert_eq!(report.cells_timed_out, 1);
        let cell = h.engine.store().cells(&d.id).unwrap().remove(0);
        assert_eq!(cell.status, CellStatus::Completed);
        assert!(cell.completed_by_timeout);
        assert_eq!(h.reload(d.id).current_tier, 2);
    }

    #[test]
    fn accumulation_deadline_starts_challenge_round() {
        let h = Harness::new();
        let settings = DeliberationSettings {
            accumulation_enabled: true,
            accumulation_duration_ms: 10_000,
            ..fcfs(3)
        };
        let d = h.deliberation(settings, 3);
        h.ideas(d.id, 1);
        h.engine.start_voting(d.id).unwrap();
        h.engine.submit_challenger(d.id, None, "one").unwrap();
        h.engine.submit_challenger(d.id, None, "two").unwrap();

        assert_eq!(h.engine.sweep_timeouts(h.advance(9_999)).unwrap().accumulations_closed, 0);
        let report = h.engine.sweep_timeouts(h.advance(1)).unwrap();
        assert_eq!(report.accumulations_closed, 1);
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Voting);
        assert_eq!(d.challenge_round, 1);
    }
}
