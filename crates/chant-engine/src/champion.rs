//! Champions, accumulation and challenge rounds.
//!
//! Declaring a champion ends a round. Without accumulation the
//! deliberation completes; with it, the deliberation collects challenger
//! ideas until the accumulation window closes and then runs a challenge
//! round in which the champion must defend its title.

use std::collections::BTreeSet;

use serde_json::json;
use tracing::{info, warn};

use chant_core::error::{ChantError, PreconditionError};
use chant_core::events::EngineEvent;
use chant_core::store::{Condition, Write, WriteSet};
use chant_core::traits::NotificationKind;
use chant_core::types::{
    CellId, Deliberation, DeliberationId, Idea, IdeaId, IdeaStatus, Phase, UserId,
};

use crate::engine::Engine;

/// Rows that crown a champion, plus what is needed to announce it.
#[derive(Clone, Debug)]
pub(crate) struct ChampionPlan {
    pub writes: WriteSet,
    pub deliberation: Deliberation,
    pub idea: Idea,
    pub from: Phase,
}

/// Result of [`Engine::start_challenge_round`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeOutcome {
    /// Voting reopened for the challengers.
    Started {
        tier: u32,
        challengers: Vec<IdeaId>,
        cells: Vec<CellId>,
    },
    /// Too few challengers: they were benched and the deliberation completed.
    Completed { benched: Vec<IdeaId> },
    /// Another caller moved the deliberation on first.
    AlreadyHandled,
}

impl Engine {
    pub(crate) fn plan_champion(
        &self,
        delib: &Deliberation,
        mut idea: Idea,
        now: u64,
    ) -> Result<ChampionPlan, ChantError> {
        let from = delib.phase;
        idea.set_status(IdeaStatus::Winner)?;
        idea.is_champion = true;

        let mut next = delib.clone();
        if delib.settings.accumulation_enabled {
            next.phase = from.transition(Phase::Accumulating)?;
            next.accumulation_ends_at = Some(now + delib.settings.accumulation_duration_ms);
        } else {
            next.phase = from.transition(Phase::Completed)?;
        }
        next.champion_id = Some(idea.id);

        let mut writes = WriteSet::new();
        if let Some(previous) = delib.champion_id.filter(|id| *id != idea.id) {
            let mut dethroned = self.load_idea(previous)?;
            dethroned.is_champion = false;
            writes.push(Write::Idea(dethroned));
        }
        writes
            .push(Write::Idea(idea.clone()))
            .push(Write::Deliberation(next.clone()));
        Ok(ChampionPlan {
            writes,
            deliberation: next,
            idea,
            from,
        })
    }

    /// Publish a committed champion.
    pub(crate) fn announce_champion(&self, plan: &ChampionPlan) -> Result<(), ChantError> {
        let delib = &plan.deliberation;
        let mut voters = BTreeSet::new();
        for cell in self.store().cells(&delib.id)? {
            for vote in self.store().votes(&cell.id)? {
                voters.insert(vote.user_id);
            }
        }

        info!(
            deliberation = %delib.id,
            idea = %plan.idea.id,
            tiers = delib.current_tier,
            voters = voters.len(),
            phase = %delib.phase,
            "champion declared"
        );
        self.emit(EngineEvent::ChampionDeclared {
            deliberation: delib.id,
            idea: plan.idea.id,
            text_hash: plan.idea.text_hash_hex(),
            total_tiers: delib.current_tier,
            total_voters: voters.len() as u32,
        });
        self.emit(EngineEvent::PhaseChanged {
            deliberation: delib.id,
            from: plan.from,
            to: delib.phase,
        });
        self.notify_members(
            delib.id,
            NotificationKind::ChampionDeclared,
            json!({ "idea": plan.idea.id.to_string(), "text": plan.idea.text }),
        );
        if delib.phase == Phase::Accumulating {
            self.notify_members(
                delib.id,
                NotificationKind::AccumulationOpened,
                json!({ "ends_at": delib.accumulation_ends_at }),
            );
        }
        if let Err(e) = self.resolve_champion_predictions(delib, plan.idea.id) {
            warn!(deliberation = %delib.id, error = %e, "champion prediction resolution failed");
        }
        Ok(())
    }

    /// Crown `idea` if `guard` still holds. Returns whether this call did it.
    pub(crate) fn declare_champion(
        &self,
        delib: &Deliberation,
        idea: Idea,
        guard: Condition,
    ) -> Result<bool, ChantError> {
        let plan = self.plan_champion(delib, idea, self.now())?;
        if !self.store().commit_if(&[guard], plan.writes.clone())? {
            return Ok(false);
        }
        self.announce_champion(&plan)?;
        Ok(true)
    }

    /// Submit an idea challenging the standing champion.
    pub fn submit_challenger(
        &self,
        deliberation: DeliberationId,
        author: Option<UserId>,
        text: &str,
    ) -> Result<Idea, ChantError> {
        let delib = self.load(deliberation)?;
        if delib.phase != Phase::Accumulating {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Accumulating,
                actual: delib.phase,
            }
            .into());
        }
        self.submit_idea(deliberation, author, text)
    }

    /// Close accumulation: run a challenge round, or complete if too few
    /// challengers arrived.
    ///
    /// Ideas eliminated in the previous round are retired and the champion
    /// sits out as DEFENDING until the field narrows below one cell (in
    /// single-cell mode it joins the one cell immediately).
    pub fn start_challenge_round(&self, deliberation: DeliberationId) -> Result<ChallengeOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        if delib.phase != Phase::Accumulating {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Accumulating,
                actual: delib.phase,
            }
            .into());
        }
        let guard = [Condition::DeliberationPhase {
            id: deliberation,
            phase: Phase::Accumulating,
        }];
        let ideas = self.store().ideas(&deliberation)?;
        let pending: Vec<&Idea> = ideas
            .iter()
            .filter(|i| i.status == IdeaStatus::Pending)
            .collect();

        if pending.len() < self.config().min_challengers {
            let mut writes = WriteSet::new();
            let mut benched = Vec::with_capacity(pending.len());
            for idea in &pending {
                let mut idea = (*idea).clone();
                idea.set_status(IdeaStatus::Benched)?;
                benched.push(idea.id);
                writes.push(Write::Idea(idea));
            }
            let mut next = delib.clone();
            next.phase = delib.phase.transition(Phase::Completed)?;
            next.accumulation_ends_at = None;
            writes.push(Write::Deliberation(next));
            if !self.store().commit_if(&guard, writes)? {
                return Ok(ChallengeOutcome::AlreadyHandled);
            }
            info!(deliberation = %deliberation, benched = benched.len(), "too few challengers, deliberation completed");
            self.emit(EngineEvent::PhaseChanged {
                deliberation,
                from: Phase::Accumulating,
                to: Phase::Completed,
            });
            return Ok(ChallengeOutcome::Completed { benched });
        }

        let members = self.store().members(&deliberation)?;
        if Self::is_seated(&delib) && members.len() < self.config().min_batch_members {
            return Err(PreconditionError::InsufficientParticipants {
                have: members.len(),
                need: self.config().min_batch_members,
            }
            .into());
        }

        let tier = delib.current_tier + 1;
        let mut next = delib.clone();
        next.phase = delib.phase.transition(Phase::Voting)?;
        next.current_tier = tier;
        next.round_start_tier = tier;
        next.challenge_round += 1;
        next.champion_entered_tier = None;
        next.accumulation_ends_at = None;
        next.submissions_closed = false;

        let mut writes = WriteSet::new();
        let mut contenders = Vec::with_capacity(pending.len() + 1);
        let mut challengers = Vec::with_capacity(pending.len());
        for idea in &ideas {
            let mut idea = idea.clone();
            match idea.status {
                IdeaStatus::Eliminated => {
                    idea.set_status(IdeaStatus::Retired)?;
                    writes.push(Write::Idea(idea));
                }
                IdeaStatus::Winner => {
                    idea.set_status(IdeaStatus::Defending)?;
                    if delib.settings.single_cell {
                        idea.set_status(IdeaStatus::Advancing)?;
                        next.champion_entered_tier = Some(tier);
                        contenders.push(idea);
                    } else {
                        writes.push(Write::Idea(idea));
                    }
                }
                IdeaStatus::Pending => {
                    idea.set_status(IdeaStatus::Submitted)?;
                    idea.tier = 0;
                    challengers.push(idea.id);
                    contenders.push(idea);
                }
                _ => {}
            }
        }

        let plans = self.plan_round(&next, &contenders, &members);
        let new = self.materialize(&next, tier, plans, &contenders, self.now())?;
        // Challengers left out of full continuous groups wait as SUBMITTED.
        for idea in &contenders {
            if !new.cells.iter().any(|c| c.contains(&idea.id)) {
                writes.push(Write::Idea(idea.clone()));
            }
        }
        writes.extend(new.writes);
        writes.push(Write::Deliberation(next.clone()));
        if !self.store().commit_if(&guard, writes)? {
            return Ok(ChallengeOutcome::AlreadyHandled);
        }

        info!(
            deliberation = %deliberation,
            round = next.challenge_round,
            tier,
            challengers = challengers.len(),
            cells = new.cells.len(),
            "challenge round started"
        );
        self.emit(EngineEvent::PhaseChanged {
            deliberation,
            from: Phase::Accumulating,
            to: Phase::Voting,
        });
        self.announce_cells(&new.cells);
        self.notify_members(
            deliberation,
            NotificationKind::ChallengeRoundStarted,
            json!({ "round": next.challenge_round, "tier": tier, "challengers": challengers.len() }),
        );
        Ok(ChallengeOutcome::Started {
            tier,
            challengers,
            cells: new.cells.iter().map(|c| c.id).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StartOutcome;
    use crate::harness::{fcfs, user, Harness};
    use crate::EngineConfig;
    use chant_core::types::DeliberationSettings;

    fn accumulating(cell_size: u32) -> DeliberationSettings {
        DeliberationSettings {
            accumulation_enabled: true,
            accumulation_duration_ms: 60_000,
            ..fcfs(cell_size)
        }
    }

    #[test]
    fn lone_idea_is_crowned_without_voting() {
        let h = Harness::new();
        let d = h.deliberation(DeliberationSettings::default(), 0);
        let idea = h.ideas(d.id, 1).remove(0);
        assert_eq!(
            h.engine.start_voting(d.id).unwrap(),
            StartOutcome::ChampionDeclared(idea.id)
        );
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Completed);
        assert_eq!(d.champion_id, Some(idea.id));
        assert!(h.engine.store().cells(&d.id).unwrap().is_empty());
    }

    #[test]
    fn accumulation_keeps_the_deliberation_open() {
        let h = Harness::new();
        let d = h.deliberation(accumulating(3), 0);
        let idea = h.ideas(d.id, 1).remove(0);
        h.engine.start_voting(d.id).unwrap();

        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Accumulating);
        assert_eq!(d.accumulation_ends_at, Some(1_000 + 60_000));
        assert_eq!(d.champion_id, Some(idea.id));
        assert_eq!(h.notifier.count(NotificationKind::AccumulationOpened), 1);
    }

    #[test]
    fn challengers_need_accumulation() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 0);
        let err = h.engine.submit_challenger(d.id, None, "late").unwrap_err();
        assert_eq!(err.code(), Some("WRONG_PHASE"));
    }

    #[test]
    fn too_few_challengers_are_benched() {
        let h = Harness::new();
        let d = h.deliberation(accumulating(3), 0);
        h.ideas(d.id, 1);
        h.engine.start_voting(d.id).unwrap();
        let lone = h.engine.submit_challenger(d.id, None, "challenger").unwrap();
        assert_eq!(lone.status, IdeaStatus::Pending);

        let out = h.engine.start_challenge_round(d.id).unwrap();
        assert_eq!(out, ChallengeOutcome::Completed { benched: vec![lone.id] });
        assert_eq!(h.reload(d.id).phase, Phase::Completed);
        assert_eq!(h.idea(lone.id).status, IdeaStatus::Benched);
        let err = h.engine.start_challenge_round(d.id).unwrap_err();
        assert_eq!(err.code(), Some("WRONG_PHASE"));
    }

    #[test]
    fn challenge_round_continues_tier_numbering() {
        let h = Harness::new();
        let d = h.deliberation(accumulating(3), 3);
        let champion = h.ideas(d.id, 1).remove(0);
        h.engine.start_voting(d.id).unwrap();
        for i in 0..3 {
            h.engine
                .submit_challenger(d.id, Some(user(i)), &format!("challenger {i}"))
                .unwrap();
        }

        let out = h.engine.start_challenge_round(d.id).unwrap();
        let ChallengeOutcome::Started { tier, challengers, cells } = out else {
            panic!("expected a challenge round, got {out:?}");
        };
        assert_eq!(tier, 1);
        assert_eq!(challengers.len(), 3);
        assert_eq!(cells.len(), 1);

        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Voting);
        assert_eq!(d.challenge_round, 1);
        assert_eq!(d.round_start_tier, 1);
        assert_eq!(h.idea(champion.id).status, IdeaStatus::Defending);
        assert_eq!(
            h.engine.start_challenge_round(d.id).unwrap_err().code(),
            Some("WRONG_PHASE")
        );
    }

    #[test]
    fn defending_champion_can_lose() {
        let h = Harness::with_config(EngineConfig::default().with_min_challengers(2));
        let d = h.deliberation(accumulating(3), 3);
        let champion = h.ideas(d.id, 1).remove(0);
        h.engine.start_voting(d.id).unwrap();
        let a = h.engine.submit_challenger(d.id, None, "a").unwrap();
        let b = h.engine.submit_challenger(d.id, None, "b").unwrap();
        h.engine.start_challenge_round(d.id).unwrap();

        // Tier 1: a beats b; the champion re-enters for tier 2.
        for i in 0..3 {
            let seat = h.engine.enter_cell(d.id, user(i)).unwrap();
            h.engine.cast_vote(seat.cell, user(i), &[(a.id, 10)]).unwrap();
        }
        let state = h.reload(d.id);
        assert_eq!(state.current_tier, 2);
        assert_eq!(state.champion_entered_tier, Some(2));
        assert_eq!(h.idea(b.id).status, IdeaStatus::Eliminated);

        // Tier 2: a against the champion.
        for i in 0..3 {
            let seat = h.engine.enter_cell(d.id, user(i)).unwrap();
            assert_eq!(seat.tier, 2);
            h.engine.cast_vote(seat.cell, user(i), &[(a.id, 10)]).unwrap();
        }
        let state = h.reload(d.id);
        assert_eq!(state.phase, Phase::Accumulating);
        assert_eq!(state.champion_id, Some(a.id));
        assert!(h.idea(a.id).is_champion);
        let old = h.idea(champion.id);
        assert!(!old.is_champion);
        assert_eq!(old.status, IdeaStatus::Eliminated);
    }
}
