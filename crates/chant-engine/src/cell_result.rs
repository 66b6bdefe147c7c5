//! Cell completion.
//!
//! A cell completes exactly once: the COMPLETED claim is committed together
//! with the idea updates it justifies, conditioned on the cell still being
//! open. Cells sharing an idea set (a batch) are claimed one by one and the
//! batch is tallied once, when its last cell closes.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use chant_core::error::ChantError;
use chant_core::events::EngineEvent;
use chant_core::store::{Condition, Write, WriteSet};
use chant_core::tally::{resolve_batch, resolve_cell, BatchVerdict, Tally};
use chant_core::types::{Cell, CellId, CellStatus, Deliberation, IdeaId, IdeaStatus, Phase, Vote};

use crate::engine::Engine;
use crate::follow_up::FollowUp;

/// Result of processing a cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellOutcome {
    /// The cell was already completed (or another caller won the claim).
    AlreadyHandled,
    /// First zero-vote timeout: the deadline was extended once.
    Extended { deadline: Option<u64> },
    /// Standalone cell resolved.
    Resolved {
        winners: Vec<IdeaId>,
        eliminated: Vec<IdeaId>,
        all_tied: bool,
    },
    /// Cell closed; its batch is still open or is being tallied elsewhere.
    BatchPending,
    /// This cell closed its batch and the batch was tallied here.
    BatchResolved {
        winner: IdeaId,
        eliminated: Vec<IdeaId>,
    },
}

impl Engine {
    /// Complete a cell and hand off to tier advancement.
    ///
    /// Safe to call concurrently and repeatedly for the same cell: exactly
    /// one call applies the result, the others report
    /// [`CellOutcome::AlreadyHandled`].
    pub fn process_cell_results(&self, cell: CellId, is_timeout: bool) -> Result<CellOutcome, ChantError> {
        self.process_cell_at(cell, is_timeout, self.now())
    }

    pub(crate) fn process_cell_at(
        &self,
        cell_id: CellId,
        is_timeout: bool,
        now: u64,
    ) -> Result<CellOutcome, ChantError> {
        let cell = self.load_cell(cell_id)?;
        if cell.status == CellStatus::Completed {
            return Ok(CellOutcome::AlreadyHandled);
        }
        let delib = self.load(cell.deliberation_id)?;
        let votes = self.store().votes(&cell_id)?;

        if is_timeout && votes.is_empty() && !cell.completed_by_timeout {
            return self.extend_cell(&delib, cell, now);
        }

        let siblings: Vec<Cell> = self
            .store()
            .cells_at_tier(&delib.id, cell.tier)?
            .into_iter()
            .filter(|c| c.id != cell.id && c.same_ideas(&cell))
            .collect();
        if cell.batch.is_some() || !siblings.is_empty() {
            return self.close_batched_cell(&delib, cell, is_timeout, now);
        }

        let tally = Tally::from_votes(&cell.idea_ids, &votes);
        let verdict = resolve_cell(&tally, self.config().min_xp_to_advance);
        let mut writes = self.settle_ideas(&cell.idea_ids, &tally, &verdict.winners)?;
        writes.push(Write::Cell(completed(&cell, is_timeout, now)?));
        if !self
            .store()
            .commit_if(&[Condition::CellNotCompleted(cell_id)], writes)?
        {
            debug!(cell = %cell_id, "cell completed by another caller");
            return Ok(CellOutcome::AlreadyHandled);
        }

        info!(
            cell = %cell_id,
            tier = cell.tier,
            winners = verdict.winners.len(),
            all_tied = verdict.all_tied,
            by_timeout = is_timeout,
            "cell completed"
        );
        self.emit(EngineEvent::CellCompleted {
            deliberation: delib.id,
            cell: cell_id,
            tier: cell.tier,
            by_timeout: is_timeout,
            winners: verdict.winners.clone(),
        });
        if let Err(e) = self.resolve_cell_predictions(&cell, &verdict.winners) {
            warn!(cell = %cell_id, error = %e, "cell prediction resolution failed");
        }
        self.hand_off(&delib, cell.tier);

        Ok(CellOutcome::Resolved {
            winners: verdict.winners,
            eliminated: verdict.losers,
            all_tied: verdict.all_tied,
        })
    }

    fn extend_cell(&self, delib: &Deliberation, cell: Cell, now: u64) -> Result<CellOutcome, ChantError> {
        let mut extended = cell.clone();
        extended.completed_by_timeout = true;
        extended.voting_deadline = Some(now + delib.settings.voting_timeout_ms);
        let guard = [
            Condition::CellNotCompleted(cell.id),
            Condition::CellNotExtended(cell.id),
        ];
        if !self
            .store()
            .commit_if(&guard, Write::Cell(extended.clone()).into())?
        {
            return Ok(CellOutcome::AlreadyHandled);
        }
        info!(cell = %cell.id, deadline = ?extended.voting_deadline, "no votes at deadline, extended once");
        Ok(CellOutcome::Extended {
            deadline: extended.voting_deadline,
        })
    }

    fn close_batched_cell(
        &self,
        delib: &Deliberation,
        cell: Cell,
        is_timeout: bool,
        now: u64,
    ) -> Result<CellOutcome, ChantError> {
        let closed = completed(&cell, is_timeout, now)?;
        if !self
            .store()
            .commit_if(&[Condition::CellNotCompleted(cell.id)], Write::Cell(closed).into())?
        {
            return Ok(CellOutcome::AlreadyHandled);
        }
        self.emit(EngineEvent::CellCompleted {
            deliberation: delib.id,
            cell: cell.id,
            tier: cell.tier,
            by_timeout: is_timeout,
            winners: Vec::new(),
        });

        let batch: Vec<Cell> = self
            .store()
            .cells_at_tier(&delib.id, cell.tier)?
            .into_iter()
            .filter(|c| c.same_ideas(&cell))
            .collect();
        if batch.iter().any(|c| c.status.is_open()) {
            debug!(cell = %cell.id, open = batch.iter().filter(|c| c.status.is_open()).count(), "batch still open");
            return Ok(CellOutcome::BatchPending);
        }
        let Some(verdict) = self.resolve_batch_cells(delib, &batch)? else {
            return Ok(CellOutcome::BatchPending);
        };

        let final_showdown = delib.settings.single_cell || (delib.is_continuous() && cell.batch.is_some());
        if final_showdown {
            let idea = self.load_idea(verdict.winner)?;
            let guard = Condition::DeliberationPhase {
                id: delib.id,
                phase: Phase::Voting,
            };
            let current = self.load(delib.id)?;
            if !self.declare_champion(&current, idea, guard)? {
                debug!(deliberation = %delib.id, "champion already declared");
            }
        } else {
            self.hand_off(delib, cell.tier);
        }
        Ok(CellOutcome::BatchResolved {
            winner: verdict.winner,
            eliminated: verdict.losers,
        })
    }

    /// Tally a closed batch and pick its single winner.
    ///
    /// Returns `None` if the batch's ideas were already settled.
    pub(crate) fn resolve_batch_cells(
        &self,
        delib: &Deliberation,
        cells: &[Cell],
    ) -> Result<Option<BatchVerdict>, ChantError> {
        let Some(first) = cells.first() else {
            return Ok(None);
        };
        let mut votes: Vec<Vote> = Vec::new();
        for cell in cells {
            votes.extend(self.store().votes(&cell.id)?);
        }
        let tally = Tally::from_votes(&first.idea_ids, &votes);
        let verdict = {
            let mut rng = self.rng();
            resolve_batch(&tally, self.config().min_xp_to_advance, &mut *rng)
        };
        let Some(verdict) = verdict else {
            return Ok(None);
        };

        let writes = self.settle_ideas(&first.idea_ids, &tally, &[verdict.winner])?;
        let guard: Vec<Condition> = first
            .idea_ids
            .iter()
            .map(|id| Condition::IdeaStatusIs {
                id: *id,
                status: IdeaStatus::InVoting,
            })
            .collect();
        if !self.store().commit_if(&guard, writes)? {
            debug!(deliberation = %delib.id, tier = first.tier, "batch already tallied");
            return Ok(None);
        }

        info!(
            deliberation = %delib.id,
            tier = first.tier,
            cells = cells.len(),
            winner = %verdict.winner,
            tied = verdict.drawn_from.len(),
            "batch resolved"
        );
        for cell in cells {
            if let Err(e) = self.resolve_cell_predictions(cell, &[verdict.winner]) {
                warn!(cell = %cell.id, error = %e, "batch prediction resolution failed");
            }
        }
        Ok(Some(verdict))
    }

    /// Idea rows after a contest: winners advance, the rest are eliminated.
    ///
    /// Every idea is credited with the XP it earned. Ideas no longer in
    /// voting are left untouched.
    pub(crate) fn settle_ideas(
        &self,
        ideas: &[IdeaId],
        tally: &Tally,
        winners: &[IdeaId],
    ) -> Result<WriteSet, ChantError> {
        let winners: BTreeSet<&IdeaId> = winners.iter().collect();
        let mut writes = WriteSet::new();
        for id in ideas {
            let mut idea = self.load_idea(*id)?;
            if idea.status != IdeaStatus::InVoting {
                warn!(idea = %id, status = %idea.status, "idea left voting before its contest closed");
                continue;
            }
            idea.total_xp += tally.xp(id);
            if winners.contains(id) {
                idea.set_status(IdeaStatus::Advancing)?;
            } else {
                idea.set_status(IdeaStatus::Eliminated)?;
                idea.losses += 1;
            }
            writes.push(Write::Idea(idea));
        }
        Ok(writes)
    }

    /// Advance after a cell closed. Failures are deferred to the follow-up queue.
    pub(crate) fn hand_off(&self, delib: &Deliberation, tier: u32) {
        let (result, follow_up) = if delib.is_continuous() {
            (
                self.advance_continuous(delib.id, tier).map(|o| debug!(?o, "flow after cell")),
                FollowUp::FormCells {
                    deliberation: delib.id,
                    tier,
                },
            )
        } else {
            (
                self.check_tier_completion(delib.id, tier).map(|o| debug!(?o, "tier check after cell")),
                FollowUp::CheckTier {
                    deliberation: delib.id,
                    tier,
                },
            )
        };
        if let Err(e) = result {
            warn!(deliberation = %delib.id, tier, error = %e, "advancement failed, deferring");
            self.follow_ups().push(follow_up);
        }
    }
}

fn completed(cell: &Cell, is_timeout: bool, now: u64) -> Result<Cell, ChantError> {
    let mut closed = cell.clone();
    closed.set_status(CellStatus::Completed)?;
    closed.completed_at = Some(now);
    closed.completed_by_timeout |= is_timeout;
    Ok(closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fcfs, user, Harness};

    /// FCFS deliberation with one open tier-1 cell of three ideas and three seated voters.
    fn one_cell(h: &Harness) -> (Deliberation, Cell) {
        let d = h.deliberation(fcfs(3), 3);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        for i in 0..3 {
            h.engine.enter_cell(d.id, user(i)).unwrap();
        }
        let cell = h.engine.store().cells(&d.id).unwrap().remove(0);
        (d, cell)
    }

    #[test]
    fn ties_share_victory() {
        let h = Harness::new();
        let (d, cell) = one_cell(&h);
        let [a, b, c] = [cell.idea_ids[0], cell.idea_ids[1], cell.idea_ids[2]];
        h.engine.cast_vote(cell.id, user(0), &[(a, 6), (b, 4)]).unwrap();
        h.engine.cast_vote(cell.id, user(1), &[(b, 6), (c, 4)]).unwrap();
        let out = h.engine.cast_vote(cell.id, user(2), &[(a, 4), (c, 6)]).unwrap();

        // A:10, B:10, C:10 -> everyone tied at the top.
        match out.completion {
            Some(CellOutcome::Resolved { winners, eliminated, all_tied }) => {
                assert_eq!(winners.len(), 3);
                assert!(eliminated.is_empty());
                assert!(!all_tied);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.idea(a).total_xp, 10);
        assert_eq!(h.reload(d.id).current_tier, 2);
    }

    #[test]
    fn tied_leaders_advance_loser_is_eliminated() {
        let h = Harness::new();
        let (_, cell) = one_cell(&h);
        let [a, b, c] = [cell.idea_ids[0], cell.idea_ids[1], cell.idea_ids[2]];
        h.engine.cast_vote(cell.id, user(0), &[(a, 6), (b, 4)]).unwrap();
        h.engine.cast_vote(cell.id, user(1), &[(b, 6), (c, 4)]).unwrap();
        let out = h.engine.cast_vote(cell.id, user(2), &[(a, 4), (b, 6)]).unwrap();

        // A:14, B:16, C:4.
        match out.completion {
            Some(CellOutcome::Resolved { winners, eliminated, .. }) => {
                assert_eq!(winners, vec![b]);
                assert_eq!(eliminated.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        let loser = h.idea(c);
        assert_eq!(loser.status, IdeaStatus::Eliminated);
        assert_eq!(loser.losses, 1);
        assert_eq!(loser.total_xp, 4);
    }

    #[test]
    fn completion_is_exactly_once() {
        let h = Harness::new();
        let (_, cell) = one_cell(&h);
        let first = h.engine.process_cell_results(cell.id, false).unwrap();
        assert!(matches!(first, CellOutcome::Resolved { all_tied: true, .. }));
        let second = h.engine.process_cell_results(cell.id, false).unwrap();
        assert_eq!(second, CellOutcome::AlreadyHandled);
        assert_eq!(
            h.sink.count(|e| matches!(e, EngineEvent::CellCompleted { .. })),
            1
        );
    }

    #[test]
    fn zero_vote_timeout_extends_once_then_completes() {
        let h = Harness::new();
        let (_, cell) = one_cell(&h);
        let out = h.engine.process_cell_results(cell.id, true).unwrap();
        assert!(matches!(out, CellOutcome::Extended { deadline: Some(_) }));
        let row = h.engine.store().cell(&cell.id).unwrap().unwrap();
        assert!(row.status.is_open());
        assert!(row.completed_by_timeout);

        let out = h.engine.process_cell_results(cell.id, true).unwrap();
        assert!(matches!(out, CellOutcome::Resolved { all_tied: true, .. }));
        let row = h.engine.store().cell(&cell.id).unwrap().unwrap();
        assert_eq!(row.status, CellStatus::Completed);
    }

    #[test]
    fn single_cell_mode_crowns_the_batch_winner() {
        let h = Harness::new();
        let settings = chant_core::types::DeliberationSettings {
            single_cell: true,
            ..fcfs(3)
        };
        let d = h.deliberation(settings, 3);
        let ideas = h.ideas(d.id, 4);
        h.engine.start_voting(d.id).unwrap();
        let seat = h.engine.enter_cell(d.id, user(0)).unwrap();
        h.engine
            .cast_vote(seat.cell, user(0), &[(ideas[2].id, 10)])
            .unwrap();
        let out = h.engine.force_complete_cell(seat.cell).unwrap();
        assert_eq!(
            out,
            CellOutcome::BatchResolved {
                winner: ideas[2].id,
                eliminated: vec![ideas[0].id, ideas[1].id, ideas[3].id],
            }
        );
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Completed);
        assert_eq!(d.champion_id, Some(ideas[2].id));
        assert!(h.idea(ideas[2].id).is_champion);
    }
}
