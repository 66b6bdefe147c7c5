//! Synchronized tier completion.
//!
//! When the last cell of a tier closes, the tier either crowns a champion
//! or advances. The advance is one conditional commit on
//! `(phase = VOTING, current_tier = tier)` carrying the new tier number,
//! every idea update and every next-tier cell, so concurrent callers cannot
//! both create next-tier cells.

use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use chant_core::error::ChantError;
use chant_core::events::EngineEvent;
use chant_core::store::{Condition, Write, WriteSet};
use chant_core::types::{
    Cell, CellId, Comment, Deliberation, DeliberationId, Idea, IdeaId, IdeaStatus, Phase,
};
use chant_core::traits::NotificationKind;

use crate::continuous::FlowOutcome;
use crate::engine::Engine;

/// Result of [`Engine::check_tier_completion`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TierOutcome {
    /// Cells of the tier are still open (or FCFS ideas are still waiting for cells).
    Pending,
    /// Another caller already advanced past this tier.
    AlreadyAdvanced,
    /// Continuous flow: the round's entry tier is still taking submissions.
    AwaitingSubmissions,
    Advanced {
        next_tier: u32,
        advancing: Vec<IdeaId>,
        backfilled: Vec<IdeaId>,
        /// Empty under FCFS, where cells are created as members arrive.
        cells: Vec<CellId>,
    },
    ChampionDeclared(IdeaId),
    /// Continuous-flow deliberations delegate to incremental formation.
    Flow(FlowOutcome),
}

/// Pick eliminated ideas to revive so a small final round reaches `slots` more ideas.
///
/// `candidates` are `(idea, xp)` pairs. The highest XP wins; ideas tied at
/// the cutoff are all admitted if `advancing` plus the selection stays
/// within `ceiling`, otherwise a random subset of the tie fills the
/// remaining slots.
pub fn select_backfill<R: Rng + ?Sized>(
    candidates: &[(IdeaId, u64)],
    advancing: usize,
    slots: usize,
    ceiling: usize,
    rng: &mut R,
) -> Vec<IdeaId> {
    if slots == 0 || candidates.is_empty() {
        return Vec::new();
    }
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    if ranked.len() <= slots {
        return ranked.into_iter().map(|(id, _)| id).collect();
    }

    let cutoff = ranked[slots - 1].1;
    let mut picked: Vec<IdeaId> = ranked
        .iter()
        .filter(|(_, xp)| *xp > cutoff)
        .map(|(id, _)| *id)
        .collect();
    let mut tied: Vec<IdeaId> = ranked
        .iter()
        .filter(|(_, xp)| *xp == cutoff)
        .map(|(id, _)| *id)
        .collect();
    if advancing + picked.len() + tied.len() > ceiling {
        tied.shuffle(rng);
        tied.truncate(slots - picked.len());
        tied.sort();
    }
    picked.extend(tied);
    picked
}

/// Ideas a backfill may revive when `advancing` of `contested` ideas go on:
/// the next round must stay smaller than this one.
pub fn backfill_room(contested: usize, advancing: usize) -> usize {
    contested.saturating_sub(1).saturating_sub(advancing)
}

/// XP earned in one tier, per contested idea.
fn tier_xp(cells: &[Cell], votes: &[chant_core::types::Vote]) -> BTreeMap<IdeaId, u64> {
    let mut totals: BTreeMap<IdeaId, u64> = cells
        .iter()
        .flat_map(|c| c.idea_ids.iter().map(|id| (*id, 0)))
        .collect();
    for vote in votes {
        if let Some(total) = totals.get_mut(&vote.idea_id) {
            *total += u64::from(vote.xp_points);
        }
    }
    totals
}

/// Most-upvoted comment attached to `idea`, if any was upvoted.
fn top_comment(comments: &[Comment], idea: IdeaId) -> Option<&Comment> {
    comments
        .iter()
        .filter(|c| c.idea_id == Some(idea) && c.upvote_count > 0)
        .max_by(|a, b| a.upvote_count.cmp(&b.upvote_count).then(b.id.cmp(&a.id)))
}

impl Engine {
    /// Advance a synchronized deliberation past `tier` once all its cells closed.
    ///
    /// Idempotent: repeated or concurrent calls for the same tier apply the
    /// advance once and report [`TierOutcome::AlreadyAdvanced`] otherwise.
    pub fn check_tier_completion(&self, deliberation: DeliberationId, tier: u32) -> Result<TierOutcome, ChantError> {
        let delib = self.load(deliberation)?;
        let cells = self.store().cells_at_tier(&deliberation, tier)?;
        if cells.iter().any(|c| c.status.is_open()) {
            return Ok(TierOutcome::Pending);
        }

        if delib.is_continuous() {
            if delib.phase != Phase::Voting {
                return Ok(TierOutcome::AlreadyAdvanced);
            }
            if tier == delib.round_start_tier && !self.submissions_drained(&delib)? {
                return Ok(TierOutcome::AwaitingSubmissions);
            }
            return Ok(TierOutcome::Flow(self.advance_continuous(deliberation, tier)?));
        }

        if delib.phase != Phase::Voting || delib.current_tier != tier {
            return Ok(TierOutcome::AlreadyAdvanced);
        }
        if cells.is_empty() {
            return Ok(TierOutcome::Pending);
        }
        if !self.store().cells_at_tier(&deliberation, tier + 1)?.is_empty() {
            warn!(deliberation = %deliberation, tier, "next-tier cells already exist");
            return Ok(TierOutcome::AlreadyAdvanced);
        }

        let ideas = self.store().ideas(&deliberation)?;
        if delib.is_fcfs() && tier > delib.round_start_tier {
            let waiting = ideas
                .iter()
                .filter(|i| i.status == IdeaStatus::Advancing && i.tier + 1 == tier)
                .count();
            if waiting > 0 {
                debug!(deliberation = %deliberation, tier, waiting, "ideas still waiting for cells");
                return Ok(TierOutcome::Pending);
            }
        }

        // Batches whose cells all closed but were never tallied.
        let mut groups: BTreeMap<Vec<IdeaId>, Vec<Cell>> = BTreeMap::new();
        for cell in &cells {
            groups.entry(cell.idea_ids.clone()).or_default().push(cell.clone());
        }
        let mut settled_batch = false;
        for group in groups.values() {
            let batched = group.len() > 1 || group.iter().any(|c| c.batch.is_some());
            let unsettled = group[0]
                .idea_ids
                .iter()
                .filter_map(|id| ideas.iter().find(|i| i.id == *id))
                .any(|i| i.status == IdeaStatus::InVoting);
            if batched && unsettled {
                settled_batch |= self.resolve_batch_cells(&delib, group)?.is_some();
            }
        }
        let ideas = if settled_batch {
            self.store().ideas(&deliberation)?
        } else {
            ideas
        };

        let mut votes = Vec::new();
        for cell in &cells {
            votes.extend(self.store().votes(&cell.id)?);
        }
        let xp = tier_xp(&cells, &votes);
        let mut advancing: Vec<Idea> = ideas
            .iter()
            .filter(|i| i.status == IdeaStatus::Advancing && i.tier == tier)
            .cloned()
            .collect();
        let mut next = delib.clone();
        next.current_tier = tier + 1;

        // A defending champion rejoins once the field has narrowed.
        if next.champion_entered_tier.is_none() && advancing.len() < delib.cell_size() {
            if let Some(champion) = ideas
                .iter()
                .find(|i| Some(i.id) == delib.champion_id && i.status == IdeaStatus::Defending)
            {
                let mut champion = champion.clone();
                champion.set_status(IdeaStatus::Advancing)?;
                champion.tier = tier;
                info!(deliberation = %deliberation, idea = %champion.id, tier = tier + 1, "champion re-enters");
                next.champion_entered_tier = Some(tier + 1);
                advancing.push(champion);
            }
        }

        let guard = [Condition::DeliberationAt {
            id: deliberation,
            phase: Phase::Voting,
            tier,
        }];
        let xp_totals: Vec<(IdeaId, u64)> = xp.iter().map(|(id, xp)| (*id, *xp)).collect();

        if let [sole] = advancing.as_slice() {
            let mut last = next.clone();
            last.current_tier = tier;
            let plan = self.plan_champion(&last, sole.clone(), self.now())?;
            if !self.store().commit_if(&guard, plan.writes.clone())? {
                return Ok(TierOutcome::AlreadyAdvanced);
            }
            self.emit(EngineEvent::TierCompleted {
                deliberation,
                tier,
                advancing: vec![sole.id],
                xp_totals,
            });
            let champion = plan.idea.id;
            self.announce_champion(&plan)?;
            return Ok(TierOutcome::ChampionDeclared(champion));
        }

        let mut backfilled = Vec::new();
        if self.config().wants_backfill(advancing.len()) {
            let candidates: Vec<(IdeaId, u64)> = ideas
                .iter()
                .filter(|i| i.status == IdeaStatus::Eliminated && i.tier == tier)
                .map(|i| (i.id, xp.get(&i.id).copied().unwrap_or(0)))
                .collect();
            // At least one contested idea leaves every tier, or a unanimous
            // field could be revived into the same round forever.
            let room = backfill_room(xp.len(), advancing.len());
            let slots = self
                .config()
                .backfill_target
                .saturating_sub(advancing.len())
                .min(room);
            let ceiling = self.config().backfill_tie_ceiling.min(advancing.len() + room);
            let picked = select_backfill(&candidates, advancing.len(), slots, ceiling, &mut *self.rng());
            for id in picked {
                if let Some(idea) = ideas.iter().find(|i| i.id == id) {
                    let mut idea = idea.clone();
                    idea.set_status(IdeaStatus::Advancing)?;
                    backfilled.push(idea.id);
                    advancing.push(idea);
                }
            }
            if !backfilled.is_empty() {
                info!(deliberation = %deliberation, tier, revived = backfilled.len(), "backfilled final round");
            }
        }
        advancing.sort_by_key(|i| i.id);
        let advancing_ids: Vec<IdeaId> = advancing.iter().map(|i| i.id).collect();

        let mut writes = WriteSet::new();
        let new_cells = if delib.is_fcfs() {
            for idea in &advancing {
                if ideas.iter().any(|i| i == idea) {
                    continue;
                }
                writes.push(Write::Idea(idea.clone()));
            }
            Vec::new()
        } else {
            let members = self.store().members(&deliberation)?;
            let plans = self.plan_seated(&advancing, &members, delib.cell_size());
            let new = self.materialize(&next, tier + 1, plans, &advancing, self.now())?;
            writes.extend(new.writes);
            new.cells
        };

        let comments = self.store().comments(&deliberation)?;
        for idea in &advancing_ids {
            if let Some(top) = top_comment(&comments, *idea) {
                let mut promoted = top.clone();
                promoted.reach_tier = tier + 1;
                promoted.upvote_count = 0;
                promoted.spread_count = 0;
                writes.push(Write::Comment(promoted));
            }
        }
        writes.push(Write::Deliberation(next));

        if !self.store().commit_if(&guard, writes)? {
            debug!(deliberation = %deliberation, tier, "tier advanced by another caller");
            return Ok(TierOutcome::AlreadyAdvanced);
        }

        info!(
            deliberation = %deliberation,
            tier,
            advancing = advancing_ids.len(),
            cells = new_cells.len(),
            "tier completed"
        );
        self.emit(EngineEvent::TierCompleted {
            deliberation,
            tier,
            advancing: advancing_ids.clone(),
            xp_totals,
        });
        self.announce_cells(&new_cells);
        self.notify_members(
            deliberation,
            NotificationKind::TierComplete,
            json!({ "tier": tier, "next_tier": tier + 1, "advancing": advancing_ids.len() }),
        );
        Ok(TierOutcome::Advanced {
            next_tier: tier + 1,
            advancing: advancing_ids,
            backfilled,
            cells: new_cells.iter().map(|c| c.id).collect(),
        })
    }

    /// Whether a round's entry tier can take no more ideas.
    pub(crate) fn submissions_drained(&self, delib: &Deliberation) -> Result<bool, ChantError> {
        if !delib.submissions_closed {
            return Ok(false);
        }
        Ok(!self
            .store()
            .ideas(&delib.id)?
            .iter()
            .any(|i| i.status == IdeaStatus::Submitted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{fcfs, user, Harness};
    use chant_core::types::{CommentId, DeliberationSettings, UserId};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ids(raw: &[u64]) -> Vec<IdeaId> {
        raw.iter().copied().map(IdeaId).collect()
    }

    #[test]
    fn backfill_admits_whole_tie_within_ceiling() {
        // D:8, E:8, F:3 with three advancing.
        let mut rng = StdRng::seed_from_u64(1);
        let picked = select_backfill(&[(IdeaId(4), 8), (IdeaId(5), 8), (IdeaId(6), 3)], 3, 2, 7, &mut rng);
        assert_eq!(picked, ids(&[4, 5]));
    }

    #[test]
    fn backfill_takes_strictly_higher_first() {
        let mut rng = StdRng::seed_from_u64(1);
        let picked = select_backfill(&[(IdeaId(1), 2), (IdeaId(2), 9), (IdeaId(3), 5)], 3, 2, 7, &mut rng);
        assert_eq!(picked, ids(&[2, 3]));
    }

    #[test]
    fn backfill_ties_over_ceiling_fill_slots_randomly() {
        let candidates: Vec<(IdeaId, u64)> = (1..=6).map(|i| (IdeaId(i), 5)).collect();
        let mut rng = StdRng::seed_from_u64(3);
        let picked = select_backfill(&candidates, 3, 2, 7, &mut rng);
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|id| id.0 >= 1 && id.0 <= 6));
    }

    #[test]
    fn backfill_with_few_candidates_takes_all() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(select_backfill(&[(IdeaId(9), 1)], 2, 3, 7, &mut rng), ids(&[9]));
        assert!(select_backfill(&[], 2, 3, 7, &mut rng).is_empty());
    }

    #[test]
    fn top_comment_needs_an_upvote() {
        let comment = |id, upvotes| Comment {
            id: CommentId(id),
            deliberation_id: DeliberationId(1),
            cell_id: CellId(1),
            idea_id: Some(IdeaId(1)),
            author: UserId::from("a"),
            text: "c".into(),
            upvote_count: upvotes,
            spread_count: 0,
            reach_tier: 1,
            created_at: 0,
        };
        assert!(top_comment(&[comment(1, 0)], IdeaId(1)).is_none());
        let all = [comment(1, 2), comment(2, 5), comment(3, 5)];
        assert_eq!(top_comment(&all, IdeaId(1)).map(|c| c.id), Some(CommentId(2)));
    }

    #[test]
    fn open_cells_keep_tier_pending() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 3);
        h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();
        assert_eq!(h.engine.check_tier_completion(d.id, 1).unwrap(), TierOutcome::Pending);
    }

    #[test]
    fn batch_tier_advances_with_seated_cells() {
        let h = Harness::new();
        let d = h.deliberation(DeliberationSettings { cell_size: 3, ..DeliberationSettings::default() }, 5);
        let ideas = h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();

        let cells = h.engine.store().cells_at_tier(&d.id, 1).unwrap();
        assert_eq!(cells.len(), 2);
        for cell in &cells {
            let favourite = cell.idea_ids[0];
            for p in h.engine.store().participants(&cell.id).unwrap() {
                h.engine.cast_vote(cell.id, p.user_id, &[(favourite, 10)]).unwrap();
            }
        }

        let d = h.reload(d.id);
        assert_eq!(d.current_tier, 2);
        // Two winners; three of the four scoreless runners-up are revived at
        // random to make a field of five, and one stays out.
        let mut in_play: Vec<IdeaId> = Vec::new();
        let tier2 = h.engine.store().cells_at_tier(&d.id, 2).unwrap();
        assert_eq!(tier2.len(), 2);
        for cell in &tier2 {
            assert_eq!(cell.batch, None);
            in_play.extend(&cell.idea_ids);
        }
        in_play.sort();
        in_play.dedup();
        assert_eq!(in_play.len(), 5);
        let out: Vec<Idea> = ideas
            .iter()
            .map(|i| h.idea(i.id))
            .filter(|i| !in_play.contains(&i.id))
            .collect();
        assert_eq!(out.len(), 1);
        assert_eq!((out[0].status, out[0].tier), (IdeaStatus::Eliminated, 1));
        assert_eq!(
            h.engine.check_tier_completion(d.id, 1).unwrap(),
            TierOutcome::AlreadyAdvanced
        );
    }

    #[test]
    fn backfill_never_refills_the_whole_field() {
        assert_eq!(backfill_room(6, 2), 3);
        assert_eq!(backfill_room(3, 2), 0);
        assert_eq!(backfill_room(2, 2), 0);
        assert_eq!(backfill_room(10, 2), 7);
    }

    #[test]
    fn fcfs_single_survivor_is_champion() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 3);
        let ideas = h.ideas(d.id, 3);
        h.engine.start_voting(d.id).unwrap();
        for i in 0..3 {
            let seat = h.engine.enter_cell(d.id, user(i)).unwrap();
            h.engine.cast_vote(seat.cell, user(i), &[(ideas[1].id, 10)]).unwrap();
        }
        let d = h.reload(d.id);
        assert_eq!(d.phase, Phase::Completed);
        assert_eq!(d.champion_id, Some(ideas[1].id));
        assert_eq!(h.idea(ideas[1].id).status, IdeaStatus::Winner);
        assert_eq!(
            h.sink.count(|e| matches!(e, EngineEvent::ChampionDeclared { .. })),
            1
        );
    }

    #[test]
    fn fcfs_advance_creates_no_cells_until_members_enter() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 6);
        let ideas = h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();
        // Fill both tier-1 cells; each crowns its lowest idea.
        for i in 0..6 {
            let seat = h.engine.enter_cell(d.id, user(i)).unwrap();
            let cell = h.engine.store().cell(&seat.cell).unwrap().unwrap();
            h.engine.cast_vote(seat.cell, user(i), &[(cell.idea_ids[0], 10)]).unwrap();
        }
        let d = h.reload(d.id);
        assert_eq!(d.current_tier, 2);
        assert!(h.engine.store().cells_at_tier(&d.id, 2).unwrap().is_empty());

        let seat = h.engine.enter_cell(d.id, user(0)).unwrap();
        assert!(seat.created);
        assert_eq!(seat.tier, 2);
        // Two winners plus three revived runners-up share one cell.
        let cell = h.engine.store().cell(&seat.cell).unwrap().unwrap();
        assert_eq!(cell.idea_ids.len(), 5);
        assert!(cell.idea_ids.iter().all(|id| ideas.iter().any(|i| i.id == *id)));
        assert_eq!(
            h.engine.check_tier_completion(d.id, 2).unwrap(),
            TierOutcome::Pending
        );
    }

    #[test]
    fn upvoted_comment_follows_its_idea() {
        let h = Harness::new();
        let d = h.deliberation(fcfs(3), 6);
        h.ideas(d.id, 6);
        h.engine.start_voting(d.id).unwrap();
        let seat = h.engine.enter_cell(d.id, user(0)).unwrap();
        let cell = h.engine.store().cell(&seat.cell).unwrap().unwrap();
        let winner = cell.idea_ids[0];
        let c = h
            .engine
            .add_comment(seat.cell, user(0), "this one", Some(winner))
            .unwrap();
        h.engine.upvote_comment(c.id).unwrap();

        for i in 0..6 {
            let seat = if i == 0 {
                seat
            } else {
                h.engine.enter_cell(d.id, user(i)).unwrap()
            };
            let cell = h.engine.store().cell(&seat.cell).unwrap().unwrap();
            h.engine.cast_vote(seat.cell, user(i), &[(cell.idea_ids[0], 10)]).unwrap();
        }
        let promoted = h.engine.store().comment(&c.id).unwrap().unwrap();
        assert_eq!(promoted.reach_tier, 2);
        assert_eq!(promoted.upvote_count, 0);
    }
}
