//! Predictions and user streaks.
//!
//! Members bet on which idea wins a cell or the whole deliberation. Cell
//! predictions resolve when their cell (or its batch) resolves; every
//! prediction learns the final tier of its idea when a champion is
//! declared. Outcome fields are written once. Each resolution commits
//! predictions and user stats together, guarded by the rows it read, and
//! starts over if another resolution got there first.

use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, warn};

use chant_core::error::{ChantError, PreconditionError, StoreError};
use chant_core::store::{Condition, Write, WriteSet};
use chant_core::traits::NotificationKind;
use chant_core::types::{
    Cell, Deliberation, DeliberationId, IdeaId, Phase, Prediction, PredictionId, PredictionScope,
    UserId, UserStats,
};

use crate::engine::{Engine, MAX_CLAIM_ATTEMPTS};

impl Engine {
    /// Place a prediction.
    pub fn predict(
        &self,
        deliberation: DeliberationId,
        user: UserId,
        scope: PredictionScope,
        idea: IdeaId,
    ) -> Result<Prediction, ChantError> {
        let delib = self.load(deliberation)?;
        self.require_member(&delib, &user)?;
        if delib.phase == Phase::Completed {
            return Err(PreconditionError::WrongPhase {
                expected: Phase::Voting,
                actual: delib.phase,
            }
            .into());
        }
        let target = self.load_idea(idea)?;
        if target.deliberation_id != deliberation {
            return Err(PreconditionError::IdeaNotFound(idea).into());
        }
        if let PredictionScope::Cell(cell_id) = scope {
            let cell = self.load_cell(cell_id)?;
            if !cell.status.is_open() {
                return Err(PreconditionError::CellClosed(cell_id).into());
            }
            if !cell.contains(&idea) {
                return Err(PreconditionError::IdeaNotInCell { idea, cell: cell_id }.into());
            }
        }
        let duplicate = self
            .store()
            .predictions(&deliberation)?
            .iter()
            .any(|p| p.user_id == user && p.scope == scope && p.won.is_none());
        if duplicate {
            return Err(PreconditionError::AlreadyPredicted.into());
        }

        let prediction = Prediction {
            id: PredictionId(self.store().next_id()?),
            deliberation_id: deliberation,
            user_id: user,
            scope,
            idea_id: idea,
            won: None,
            became_champion: false,
            final_tier: None,
            created_at: self.now(),
            resolved_at: None,
        };
        self.store().commit(Write::Prediction(prediction.clone()).into())?;
        Ok(prediction)
    }

    /// Settle the open predictions on `cell` against its winners.
    pub(crate) fn resolve_cell_predictions(&self, cell: &Cell, winners: &[IdeaId]) -> Result<usize, ChantError> {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = self.now();
            let open: Vec<Prediction> = self
                .store()
                .predictions(&cell.deliberation_id)?
                .into_iter()
                .filter(|p| p.scope == PredictionScope::Cell(cell.id) && p.won.is_none())
                .collect();
            if open.is_empty() {
                return Ok(0);
            }

            let mut batch = StatsBatch::default();
            let mut results = Vec::with_capacity(open.len());
            for prediction in open {
                let mut next = prediction.clone();
                let won = winners.contains(&next.idea_id);
                next.won = Some(won);
                next.resolved_at = Some(now);
                batch.stats(self, &next.user_id)?.record(won);
                results.push((next.user_id.clone(), won));
                batch.update(prediction, next);
            }
            if !batch.commit(self)? {
                debug!(cell = %cell.id, "prediction rows moved, retrying");
                continue;
            }

            debug!(cell = %cell.id, resolved = results.len(), "cell predictions resolved");
            for (user, won) in &results {
                self.notify_user(
                    user,
                    NotificationKind::PredictionResolved,
                    json!({ "cell": cell.id.to_string(), "won": won }),
                );
            }
            return Ok(results.len());
        }
        warn!(cell = %cell.id, "gave up resolving cell predictions under contention");
        Ok(0)
    }

    /// Record the round's outcome on every prediction of the deliberation.
    ///
    /// Each prediction learns the tier its own idea reached.
    pub(crate) fn resolve_champion_predictions(
        &self,
        delib: &Deliberation,
        champion: IdeaId,
    ) -> Result<usize, ChantError> {
        let reached: BTreeMap<IdeaId, u32> = self
            .store()
            .ideas(&delib.id)?
            .into_iter()
            .map(|i| (i.id, i.tier))
            .collect();
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let now = self.now();
            let mut batch = StatsBatch::default();
            for prediction in self.store().predictions(&delib.id)? {
                let mut next = prediction.clone();
                if next.final_tier.is_none() {
                    next.final_tier = reached.get(&next.idea_id).copied();
                }
                if next.idea_id == champion && !next.became_champion {
                    next.became_champion = true;
                    batch.stats(self, &next.user_id)?.champion_picks += 1;
                }
                if next.scope == PredictionScope::Deliberation && next.won.is_none() {
                    next.won = Some(next.idea_id == champion);
                    next.resolved_at = Some(now);
                }
                if next != prediction {
                    batch.update(prediction, next);
                }
            }
            let touched = batch.predictions();
            if touched == 0 {
                return Ok(0);
            }
            if batch.commit(self)? {
                debug!(deliberation = %delib.id, touched, "champion predictions resolved");
                return Ok(touched);
            }
        }
        warn!(deliberation = %delib.id, "gave up resolving champion predictions under contention");
        Ok(0)
    }
}

/// Prediction and stats rows changed together, each guarded by the
/// snapshot it was derived from.
#[derive(Default)]
struct StatsBatch {
    guard: Vec<Condition>,
    writes: WriteSet,
    stats: BTreeMap<UserId, UserStats>,
}

impl StatsBatch {
    /// Stats for `user`, read from the store on first use.
    fn stats(&mut self, engine: &Engine, user: &UserId) -> Result<&mut UserStats, ChantError> {
        if !self.stats.contains_key(user) {
            let current = engine.store().user_stats(user)?;
            self.guard.push(Condition::UserStatsIs(Box::new(current.clone())));
            self.stats.insert(user.clone(), current);
        }
        self.stats
            .get_mut(user)
            .ok_or_else(|| StoreError::Missing(format!("stats for {user}")).into())
    }

    fn update(&mut self, before: Prediction, after: Prediction) {
        self.guard.push(Condition::PredictionIs(Box::new(before)));
        self.writes.push(Write::Prediction(after));
    }

    fn predictions(&self) -> usize {
        self.writes.len()
    }

    fn commit(self, engine: &Engine) -> Result<bool, ChantError> {
        let mut writes = self.writes;
        for (_, entry) in self.stats {
            writes.push(Write::UserStats(entry));
        }
        Ok(engine.store().commit_if(&self.guard, writes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fcfs, user, Harness};
    use chant_core::types::IdeaStatus;

    #[test]
    fn cell_predictions_update_streaks() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 3);
        h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        let cell = h.engine.store().cells(&d.id).unwrap().remove(0);
        let [a, b, _] = [cell.idea_ids[0], cell.idea_ids[1], cell.idea_ids[2]];

        h.engine.predict(d.id, user(0), PredictionScope::Cell(cell.id), a).unwrap();
        h.engine.predict(d.id, user(1), PredictionScope::Cell(cell.id), b).unwrap();
        let err = h
            .engine
            .predict(d.id, user(0), PredictionScope::Cell(cell.id), b)
            .unwrap_err();
        assert_eq!(err.code(), Some("ALREADY_PREDICTED"));

        for i in 0..3 {
            h.engine.enter_cell(d.id, user(i)).unwrap();
            h.engine.cast_vote(cell.id, user(i), &[(a, 10)]).unwrap();
        }

        let winner = h.engine.store().user_stats(&user(0)).unwrap();
        assert_eq!((winner.current_streak, winner.best_streak, winner.correct_predictions), (1, 1, 1));
        let loser = h.engine.store().user_stats(&user(1)).unwrap();
        assert_eq!((loser.current_streak, loser.total_predictions), (0, 1));
        assert_eq!(h.notifier.count(NotificationKind::PredictionResolved), 2);
    }

    #[test]
    fn champion_pick_is_counted_once() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 3);
        let ideas = h.ideas(d.id, 3);
        h.engine
            .predict(d.id, user(0), PredictionScope::Deliberation, ideas[2].id)
            .unwrap();
        h.engine
            .predict(d.id, user(1), PredictionScope::Deliberation, ideas[0].id)
            .unwrap();
        h.engine.start_voting(d.id).unwrap();
        for i in 0..3 {
            let seat = h.engine.enter_cell(d.id, user(i)).unwrap();
            h.engine.cast_vote(seat.cell, user(i), &[(ideas[2].id, 10)]).unwrap();
        }

        let predictions = h.engine.store().predictions(&d.id).unwrap();
        let picked = predictions.iter().find(|p| p.user_id == user(0)).unwrap();
        assert!(picked.became_champion);
        assert_eq!(picked.won, Some(true));
        assert_eq!(picked.final_tier, Some(1));
        let missed = predictions.iter().find(|p| p.user_id == user(1)).unwrap();
        assert_eq!(missed.won, Some(false));
        assert_eq!(missed.final_tier, Some(1));
        assert_eq!(h.engine.store().user_stats(&user(0)).unwrap().champion_picks, 1);
    }

    #[test]
    fn final_tier_is_where_the_predicted_idea_stopped() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 6);
        h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();
        let mut cells = h.engine.store().cells_at_tier(&d.id, 1).unwrap();
        cells.sort_by_key(|c| c.id);
        let (first, second) = (&cells[0], &cells[1]);
        let champion = first.idea_ids[0];
        let dropped = second.idea_ids[2];
        h.engine
            .predict(d.id, user(0), PredictionScope::Deliberation, dropped)
            .unwrap();
        h.engine
            .predict(d.id, user(1), PredictionScope::Deliberation, champion)
            .unwrap();

        // Runners-up score 3, 1 and 4; the scoreless one is left out of the
        // backfill and stops at tier 1.
        let tails = [
            [(first.idea_ids[0], 6), (first.idea_ids[1], 3), (first.idea_ids[2], 1)],
            [(second.idea_ids[0], 6), (second.idea_ids[1], 4), (second.idea_ids[2], 0)],
        ];
        for (n, cell) in [first, second].into_iter().enumerate() {
            for k in 0..3 {
                let u = n * 3 + k;
                let seat = h.engine.enter_cell(d.id, user(u)).unwrap();
                assert_eq!(seat.cell, cell.id);
                let ballot: Vec<(IdeaId, u32)> = if k < 2 {
                    vec![(cell.idea_ids[0], 10)]
                } else {
                    tails[n].iter().copied().filter(|(_, xp)| *xp > 0).collect()
                };
                h.engine.cast_vote(cell.id, user(u), &ballot).unwrap();
            }
        }
        assert_eq!(h.reload(d.id).current_tier, 2);
        let loser = h.idea(dropped);
        assert_eq!((loser.status, loser.tier), (IdeaStatus::Eliminated, 1));

        for u in 0..3 {
            let seat = h.engine.enter_cell(d.id, user(u)).unwrap();
            assert_eq!(seat.tier, 2);
            h.engine.cast_vote(seat.cell, user(u), &[(champion, 10)]).unwrap();
        }
        assert_eq!(h.reload(d.id).champion_id, Some(champion));

        let predictions = h.engine.store().predictions(&d.id).unwrap();
        let missed = predictions.iter().find(|p| p.user_id == user(0)).unwrap();
        assert_eq!(missed.won, Some(false));
        assert_eq!(missed.final_tier, Some(1));
        let picked = predictions.iter().find(|p| p.user_id == user(1)).unwrap();
        assert_eq!(picked.won, Some(true));
        assert_eq!(picked.final_tier, Some(2));
    }

    #[test]
    fn predictions_close_with_the_deliberation() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 1);
        let idea = h.ideas(d.id, 1).remove(0);
        h.engine.start_voting(d.id).unwrap();
        let err = h
            .engine
            .predict(d.id, user(0), PredictionScope::Deliberation, idea.id)
            .unwrap_err();
        assert_eq!(err.code(), Some("WRONG_PHASE"));
        let err = h
            .engine
            .predict(d.id, UserId::from("stranger"), PredictionScope::Deliberation, idea.id)
            .unwrap_err();
        assert_eq!(err.code(), Some("NOT_A_MEMBER"));
    }
}
