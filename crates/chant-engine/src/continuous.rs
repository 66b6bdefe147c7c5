//! Continuous flow.
//!
//! Instead of waiting for a whole tier, a next-tier cell forms as soon as
//! `cell_size` winners are waiting at a tier. A group is claimed
//! (ADVANCING -> IN_VOTING) together with its new cell in one conditional
//! commit, so two formations never share an idea. Work left over after a formation is queued as a
//! [`FollowUp`] instead of recursing.
//!
//! When a tier can no longer fill a cell, its leftovers get a bye into the
//! next tier if anything is still happening above them. At the top of the
//! round the remaining pool meets in a showdown cell, which any number of
//! sibling cells may join, or is crowned outright if only one idea is left.

use tracing::{debug, info, warn};

use chant_core::error::{ChantError, PreconditionError};
use chant_core::store::{Condition, Write, WriteSet};
use chant_core::types::{Cell, CellId, Deliberation, DeliberationId, Idea, IdeaId, IdeaStatus, Phase};

use crate::assignment::plan_idea_groups;
use crate::engine::Engine;
use crate::follow_up::FollowUp;

/// Result of a continuous-flow formation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Not enough ideas yet and cells below are still producing winners.
    Waiting,
    /// Not a continuous-flow deliberation in VOTING.
    Inactive,
    Formed { cell: CellId, tier: u32 },
    /// Another caller claimed some of the ideas first; nothing changed.
    ClaimLost,
    /// Leftover ideas were passed to `tier` without a contest.
    Promoted { ideas: Vec<IdeaId>, tier: u32 },
    /// The final pool meets in a showdown cell at `tier`.
    Showdown { cell: CellId, tier: u32 },
    ChampionDeclared(IdeaId),
}

fn oldest_first(ideas: &mut [&Idea]) {
    ideas.sort_by_key(|i| (i.created_at, i.id));
}

impl Engine {
    /// Form next-tier cells from winners waiting at `tier`.
    pub fn advance_continuous(&self, deliberation: DeliberationId, tier: u32) -> Result<FlowOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        if !delib.is_continuous() || delib.phase != Phase::Voting {
            return Ok(FlowOutcome::Inactive);
        }
        let cs = delib.cell_size();
        let ideas = self.store().ideas(&deliberation)?;
        let mut waiting: Vec<&Idea> = ideas
            .iter()
            .filter(|i| i.status == IdeaStatus::Advancing && i.tier == tier)
            .collect();
        oldest_first(&mut waiting);

        if waiting.len() >= cs {
            let group: Vec<IdeaId> = waiting[..cs].iter().map(|i| i.id).collect();
            let formed = self.claim_and_open(&delib, &group, IdeaStatus::Advancing, tier, tier + 1, None)?;
            // A lost claim means the rows moved under us; look again later.
            if waiting.len() > cs || formed.is_none() {
                self.follow_ups().push(FollowUp::FormCells { deliberation, tier });
            }
            return Ok(match formed {
                Some(cell) => FlowOutcome::Formed {
                    cell: cell.id,
                    tier: tier + 1,
                },
                None => FlowOutcome::ClaimLost,
            });
        }

        let cells = self.store().cells(&deliberation)?;
        let feeders_alive = cells.iter().any(|c| c.status.is_open() && c.tier <= tier)
            || ideas
                .iter()
                .any(|i| i.status == IdeaStatus::Advancing && i.tier < tier)
            || !self.submissions_drained(&delib)?;
        if feeders_alive {
            return Ok(FlowOutcome::Waiting);
        }

        let higher_alive = cells.iter().any(|c| c.status.is_open() && c.tier > tier)
            || ideas
                .iter()
                .any(|i| i.status == IdeaStatus::Advancing && i.tier > tier);

        if waiting.is_empty() {
            // Everything here was claimed; a stalled tier above may now be final.
            let stalled = ideas
                .iter()
                .filter(|i| i.status == IdeaStatus::Advancing && i.tier > tier)
                .map(|i| i.tier)
                .min();
            if let Some(above) = stalled {
                self.follow_ups().push(FollowUp::FormCells {
                    deliberation,
                    tier: above,
                });
            }
            return Ok(FlowOutcome::Waiting);
        }

        let ids: Vec<IdeaId> = waiting.iter().map(|i| i.id).collect();
        if higher_alive {
            let moved = self
                .store()
                .transition_ideas(&ids, IdeaStatus::Advancing, IdeaStatus::Advancing, tier + 1)?;
            if moved.is_empty() {
                return Ok(FlowOutcome::ClaimLost);
            }
            self.raise_tier(deliberation, tier + 1)?;
            info!(deliberation = %deliberation, tier = tier + 1, ideas = moved.len(), "leftovers promoted");
            self.follow_ups().push(FollowUp::FormCells {
                deliberation,
                tier: tier + 1,
            });
            return Ok(FlowOutcome::Promoted {
                ideas: moved,
                tier: tier + 1,
            });
        }

        self.finish_round(&delib, &ideas, ids, tier)
    }

    /// Top of the round: crown the last idea or open the showdown.
    fn finish_round(
        &self,
        delib: &Deliberation,
        ideas: &[Idea],
        mut pool: Vec<IdeaId>,
        tier: u32,
    ) -> Result<FlowOutcome, ChantError> {
        if delib.champion_entered_tier.is_none() {
            let defending = ideas
                .iter()
                .find(|i| Some(i.id) == delib.champion_id && i.status == IdeaStatus::Defending);
            if let Some(champion) = defending {
                let moved = self.store().transition_ideas(
                    &[champion.id],
                    IdeaStatus::Defending,
                    IdeaStatus::Advancing,
                    tier,
                )?;
                if !moved.is_empty() {
                    self.update_deliberation(delib.id, |d| {
                        d.champion_entered_tier = Some(tier + 1);
                        true
                    })?;
                    info!(deliberation = %delib.id, idea = %champion.id, "champion re-enters for the showdown");
                    pool.extend(moved);
                }
            }
        }

        if let [sole] = pool.as_slice() {
            let idea = self.load_idea(*sole)?;
            let current = self.load(delib.id)?;
            let guard = Condition::DeliberationPhase {
                id: delib.id,
                phase: Phase::Voting,
            };
            return Ok(if self.declare_champion(&current, idea, guard)? {
                FlowOutcome::ChampionDeclared(*sole)
            } else {
                FlowOutcome::ClaimLost
            });
        }

        let current = self.load(delib.id)?;
        match self.claim_and_open(&current, &pool, IdeaStatus::Advancing, tier, tier + 1, Some(0))? {
            Some(cell) => {
                info!(deliberation = %delib.id, cell = %cell.id, ideas = pool.len(), "final showdown opened");
                Ok(FlowOutcome::Showdown {
                    cell: cell.id,
                    tier: tier + 1,
                })
            }
            None => Ok(FlowOutcome::ClaimLost),
        }
    }

    /// Claim `ids` out of `from` and open one cell for them at `to_tier`.
    ///
    /// The claim and the cell are one conditional commit: every idea must
    /// still be in `from` at `from_tier`, otherwise nothing is written and
    /// `None` comes back.
    pub(crate) fn claim_and_open(
        &self,
        delib: &Deliberation,
        ids: &[IdeaId],
        from: IdeaStatus,
        from_tier: u32,
        to_tier: u32,
        batch: Option<u32>,
    ) -> Result<Option<Cell>, ChantError> {
        let mut guard = Vec::with_capacity(ids.len());
        let mut writes = WriteSet::new();
        for id in ids {
            let mut idea = self.load_idea(*id)?;
            if idea.status != from || idea.tier != from_tier {
                debug!(deliberation = %delib.id, idea = %id, "idea already claimed");
                return Ok(None);
            }
            guard.push(Condition::IdeaAt {
                id: *id,
                status: from,
                tier: from_tier,
            });
            idea.set_status(IdeaStatus::InVoting)?;
            idea.tier = to_tier;
            writes.push(Write::Idea(idea));
        }

        let mut sorted = ids.to_vec();
        sorted.sort();
        let cell = self.open_cell(delib, to_tier, batch, sorted, self.now())?;
        writes.push(Write::Cell(cell.clone()));
        if !self.store().commit_if(&guard, writes)? {
            warn!(deliberation = %delib.id, wanted = ids.len(), "claim lost to a concurrent formation");
            return Ok(None);
        }
        self.raise_tier(delib.id, to_tier)?;
        debug!(deliberation = %delib.id, cell = %cell.id, tier = to_tier, "cell formed");
        self.announce_cells(std::slice::from_ref(&cell));
        Ok(Some(cell))
    }

    fn raise_tier(&self, deliberation: DeliberationId, tier: u32) -> Result<(), ChantError> {
        self.update_deliberation(deliberation, |d| {
            if d.current_tier >= tier {
                return false;
            }
            d.current_tier = tier;
            true
        })?;
        Ok(())
    }

    /// Open entry cells from full groups of submitted ideas.
    pub fn form_entry_cells(&self, deliberation: DeliberationId) -> Result<FlowOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        if !delib.is_continuous() || delib.phase != Phase::Voting {
            return Ok(FlowOutcome::Inactive);
        }
        let ideas = self.store().ideas(&deliberation)?;
        let mut submitted: Vec<&Idea> = ideas
            .iter()
            .filter(|i| i.status == IdeaStatus::Submitted)
            .collect();
        oldest_first(&mut submitted);
        let ids: Vec<IdeaId> = submitted.iter().map(|i| i.id).collect();

        let mut outcome = FlowOutcome::Waiting;
        for group in plan_idea_groups(&ids, delib.cell_size(), true) {
            outcome = match self.claim_and_open(
                &delib,
                &group,
                IdeaStatus::Submitted,
                0,
                delib.round_start_tier,
                None,
            )? {
                Some(cell) => FlowOutcome::Formed {
                    cell: cell.id,
                    tier: cell.tier,
                },
                None => FlowOutcome::ClaimLost,
            };
        }
        Ok(outcome)
    }

    /// Stop taking ideas for the current round and place the leftovers.
    ///
    /// A single leftover advances with a bye; two or more share cells.
    pub fn close_submissions(&self, deliberation: DeliberationId) -> Result<FlowOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        if !delib.is_continuous() {
            return Err(PreconditionError::NotContinuous.into());
        }
        if delib.phase != Phase::Voting {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Voting,
                actual: delib.phase,
            }
            .into());
        }
        self.update_deliberation(deliberation, |d| {
            if d.submissions_closed {
                return false;
            }
            d.submissions_closed = true;
            true
        })?;

        let entry = delib.round_start_tier;
        let ideas = self.store().ideas(&deliberation)?;
        let mut leftovers: Vec<&Idea> = ideas
            .iter()
            .filter(|i| i.status == IdeaStatus::Submitted)
            .collect();
        oldest_first(&mut leftovers);
        let ids: Vec<IdeaId> = leftovers.iter().map(|i| i.id).collect();
        info!(deliberation = %deliberation, leftovers = ids.len(), "submissions closed");

        let outcome = match ids.len() {
            0 => FlowOutcome::Waiting,
            1 => {
                let moved = self
                    .store()
                    .transition_ideas(&ids, IdeaStatus::Submitted, IdeaStatus::Advancing, entry)?;
                FlowOutcome::Promoted { ideas: moved, tier: entry }
            }
            _ => {
                let mut outcome = FlowOutcome::Waiting;
                for group in plan_idea_groups(&ids, delib.cell_size(), false) {
                    outcome = match self.claim_and_open(&delib, &group, IdeaStatus::Submitted, 0, entry, None)? {
                        Some(cell) => FlowOutcome::Formed {
                            cell: cell.id,
                            tier: entry,
                        },
                        None => FlowOutcome::ClaimLost,
                    };
                }
                outcome
            }
        };
        self.follow_ups().push(FollowUp::FormCells {
            deliberation,
            tier: entry,
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StartOutcome;
    use crate::harness::{continuous, user, Harness};
    use crate::CellOutcome;
    use chant_core::types::CellStatus;

    /// Seat three named users in `cell` and have them all back `winner`.
    fn fill(h: &Harness, d: DeliberationId, cell: CellId, users: [usize; 3], winner: IdeaId) {
        for u in users {
            let seat = h.engine.enter_cell(d, user(u)).unwrap();
            assert_eq!(seat.cell, cell, "user m{u} was steered elsewhere");
            h.engine.cast_vote(cell, user(u), &[(winner, 10)]).unwrap();
        }
    }

    fn open_cells(h: &Harness, d: DeliberationId) -> Vec<Cell> {
        h.engine
            .store()
            .cells(&d)
            .unwrap()
            .into_iter()
            .filter(|c| c.status.is_open())
            .collect()
    }

    #[test]
    fn entry_cells_form_as_ideas_arrive() {
        let h = Harness::new();
        let d = h.deliberation(continuous(3), 0);
        h.ideas(d.id, 2);
        assert_eq!(
            h.engine.start_voting(d.id).unwrap(),
            StartOutcome::Started { tier: 1, cells: vec![] }
        );
        assert!(open_cells(&h, d.id).is_empty());

        h.engine.submit_idea(d.id, None, "third").unwrap();
        let cells = open_cells(&h, d.id);
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].tier, 1);
        assert_eq!(cells[0].idea_ids.len(), 3);
    }

    #[test]
    fn closing_submissions_requires_continuous_flow() {
        let h = Harness::new();
        let d = h.deliberation(crate::harness::fcfs(3), 0);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        let err = h.engine.close_submissions(d.id).unwrap_err();
        assert_eq!(err.code(), Some("NOT_CONTINUOUS"));
    }

    #[test]
    fn submissions_rejected_after_close() {
        let h = Harness::new();
        let d = h.deliberation(continuous(3), 0);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        h.engine.close_submissions(d.id).unwrap();
        let err = h.engine.submit_idea(d.id, None, "late").unwrap_err();
        assert_eq!(err.code(), Some("SUBMISSIONS_CLOSED"));
    }

    #[test]
    fn lone_leftover_gets_a_bye() {
        let h = Harness::new();
        let d = h.deliberation(continuous(3), 0);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        let late = h.engine.submit_idea(d.id, None, "straggler").unwrap();
        let out = h.engine.close_submissions(d.id).unwrap();
        assert_eq!(
            out,
            FlowOutcome::Promoted {
                ideas: vec![late.id],
                tier: 1
            }
        );
        assert_eq!(h.idea(late.id).status, IdeaStatus::Advancing);
    }

    #[test]
    fn winners_form_the_next_tier_without_waiting_for_the_tier() {
        let h = Harness::new();
        let d = h.deliberation(continuous(3), 12);
        h.ideas(d.id, 9);
        h.engine.start_voting(d.id).unwrap();
        h.engine.close_submissions(d.id).unwrap();
        let entry = open_cells(&h, d.id);
        assert_eq!(entry.len(), 3);

        // First cell: no votes, everything advances -> a full tier-2 group at once.
        let out = h.engine.force_complete_cell(entry[0].id).unwrap();
        assert!(matches!(out, CellOutcome::Resolved { all_tied: true, .. }));
        let tier2: Vec<Cell> = open_cells(&h, d.id).into_iter().filter(|c| c.tier == 2).collect();
        assert_eq!(tier2.len(), 1);
        assert_eq!(tier2[0].idea_ids, entry[0].idea_ids);
        assert_eq!(h.reload(d.id).current_tier, 2);

        // Members are steered to the highest tier first: tier 2 resolves while
        // the other entry cells are still voting, so its winner waits.
        fill(&h, d.id, tier2[0].id, [0, 1, 2], tier2[0].idea_ids[0]);
        assert_eq!(h.idea(tier2[0].idea_ids[0]).status, IdeaStatus::Advancing);

        // The last two entry winners cannot fill a cell; with a winner waiting
        // above, they get a bye into tier 2 and tier 3 forms from the follow-up.
        fill(&h, d.id, entry[1].id, [3, 4, 5], entry[1].idea_ids[0]);
        fill(&h, d.id, entry[2].id, [6, 7, 8], entry[2].idea_ids[0]);
        let bye = h.idea(entry[1].idea_ids[0]);
        assert_eq!((bye.status, bye.tier), (IdeaStatus::Advancing, 2));
        h.engine.run_follow_ups().unwrap();
        let tier3: Vec<Cell> = open_cells(&h, d.id).into_iter().filter(|c| c.tier == 3).collect();
        assert_eq!(tier3.len(), 1);
        assert_eq!(tier3[0].idea_ids.len(), 3);

        // The last cell standing crowns the champion.
        fill(&h, d.id, tier3[0].id, [9, 10, 11], tier3[0].idea_ids[1]);
        h.engine.run_follow_ups().unwrap();
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Completed);
        assert_eq!(d.champion_id, Some(tier3[0].idea_ids[1]));
    }

    #[test]
    fn showdown_opens_siblings_when_full() {
        let h = Harness::new();
        let d = h.deliberation(continuous(3), 9);
        h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();
        h.engine.close_submissions(d.id).unwrap();
        let entry = open_cells(&h, d.id);
        assert_eq!(entry.len(), 2);

        fill(&h, d.id, entry[0].id, [0, 1, 2], entry[0].idea_ids[0]);
        fill(&h, d.id, entry[1].id, [3, 4, 5], entry[1].idea_ids[0]);
        h.engine.run_follow_ups().unwrap();

        let showdown = open_cells(&h, d.id);
        assert_eq!(showdown.len(), 1);
        assert_eq!(showdown[0].batch, Some(0));
        assert_eq!(showdown[0].idea_ids.len(), 2);
        let finalists = showdown[0].idea_ids.clone();

        // Three members fill the showdown; a fourth opens a sibling cell.
        for u in 0..3 {
            h.engine.enter_cell(d.id, user(u)).unwrap();
        }
        let extra = h.engine.enter_cell(d.id, user(6)).unwrap();
        assert!(extra.created);
        assert_ne!(extra.cell, showdown[0].id);

        for u in 0..3 {
            h.engine
                .cast_vote(showdown[0].id, user(u), &[(finalists[0], 10)])
                .unwrap();
        }
        assert_eq!(
            h.engine.store().cell(&showdown[0].id).unwrap().unwrap().status,
            CellStatus::Completed
        );
        assert_eq!(h.reload(d.id).phase, Phase::Voting);

        h.engine
            .cast_vote(extra.cell, user(6), &[(finalists[1], 10)])
            .unwrap();
        let out = h.engine.force_complete_cell(extra.cell).unwrap();
        assert_eq!(
            out,
            CellOutcome::BatchResolved {
                winner: finalists[0],
                eliminated: vec![finalists[1]],
            }
        );
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Completed);
        assert_eq!(d.champion_id, Some(finalists[0]));
    }
}
