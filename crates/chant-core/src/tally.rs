//! XP vote tallying and winner resolution.
//!
//! Votes carry an XP weight; an idea's score is the sum of XP allocated to
//! it. When a cell had at most one distinct voter, ideas need at least the
//! configured minimum XP to qualify. No qualifying idea means every idea
//! advances: low turnout never eliminates anything.

use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;

use crate::types::{IdeaId, UserId, Vote};

/// Per-idea XP totals over one cell or one batch of cells.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    xp: BTreeMap<IdeaId, u64>,
    voters: BTreeSet<UserId>,
}

impl Tally {
    /// An empty tally over the given idea set.
    pub fn new(ideas: &[IdeaId]) -> Self {
        Self {
            xp: ideas.iter().map(|id| (*id, 0)).collect(),
            voters: BTreeSet::new(),
        }
    }

    /// Tally `votes` over `ideas`. Votes for ideas outside the set are ignored.
    pub fn from_votes(ideas: &[IdeaId], votes: &[Vote]) -> Self {
        let mut tally = Self::new(ideas);
        tally.add_votes(votes);
        tally
    }

    pub fn add_votes(&mut self, votes: &[Vote]) {
        for vote in votes {
            if let Some(total) = self.xp.get_mut(&vote.idea_id) {
                *total += u64::from(vote.xp_points);
                self.voters.insert(vote.user_id.clone());
            }
        }
    }

    pub fn xp(&self, idea: &IdeaId) -> u64 {
        self.xp.get(idea).copied().unwrap_or(0)
    }

    /// Distinct users who allocated XP to any idea of the set.
    pub fn voter_count(&self) -> usize {
        self.voters.len()
    }

    pub fn total_xp(&self) -> u64 {
        self.xp.values().sum()
    }

    pub fn ideas(&self) -> impl Iterator<Item = &IdeaId> {
        self.xp.keys()
    }

    /// `(idea, xp)` pairs in idea order.
    pub fn entries(&self) -> impl Iterator<Item = (IdeaId, u64)> + '_ {
        self.xp.iter().map(|(id, xp)| (*id, *xp))
    }

    /// XP an idea must reach to qualify as a winner.
    pub fn threshold(&self, min_xp_single_voter: u64) -> u64 {
        if self.voter_count() <= 1 {
            min_xp_single_voter
        } else {
            0
        }
    }

    /// Ideas at the maximum qualifying XP. Empty when nothing qualifies.
    pub fn leaders(&self, min_xp_single_voter: u64) -> Vec<IdeaId> {
        let threshold = self.threshold(min_xp_single_voter);
        let best = self
            .xp
            .values()
            .copied()
            .filter(|xp| *xp > 0 && *xp >= threshold)
            .max();
        match best {
            Some(best) => self
                .xp
                .iter()
                .filter(|(_, xp)| **xp == best)
                .map(|(id, _)| *id)
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Outcome of a single cell voting on its own idea set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellVerdict {
    /// Every idea at the top qualifying XP (ties share victory).
    pub winners: Vec<IdeaId>,
    pub losers: Vec<IdeaId>,
    /// No idea qualified, so every idea advances.
    pub all_tied: bool,
}

/// Resolve a standalone cell.
pub fn resolve_cell(tally: &Tally, min_xp_single_voter: u64) -> CellVerdict {
    let leaders = tally.leaders(min_xp_single_voter);
    if leaders.is_empty() {
        return CellVerdict {
            winners: tally.ideas().copied().collect(),
            losers: Vec::new(),
            all_tied: true,
        };
    }
    let losers = tally
        .ideas()
        .filter(|id| !leaders.contains(id))
        .copied()
        .collect();
    CellVerdict {
        winners: leaders,
        losers,
        all_tied: false,
    }
}

/// Outcome of a batch: exactly one winner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchVerdict {
    pub winner: IdeaId,
    pub losers: Vec<IdeaId>,
    /// Ideas the winner was drawn from (length 1 when there was no tie).
    pub drawn_from: Vec<IdeaId>,
}

/// Resolve a batch (or any contest that must yield a single winner).
///
/// Ties at the top, including the no-qualifier case, are broken by a random
/// draw. Returns `None` for an empty idea set.
pub fn resolve_batch<R: Rng + ?Sized>(
    tally: &Tally,
    min_xp_single_voter: u64,
    rng: &mut R,
) -> Option<BatchVerdict> {
    let mut candidates = tally.leaders(min_xp_single_voter);
    if candidates.is_empty() {
        candidates = tally.ideas().copied().collect();
    }
    let winner = *candidates.choose(rng)?;
    let losers = tally.ideas().filter(|id| **id != winner).copied().collect();
    Some(BatchVerdict {
        winner,
        losers,
        drawn_from: candidates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CellId, DeliberationId};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vote(user: &str, idea: u64, xp: u32) -> Vote {
        Vote {
            cell_id: CellId(1),
            deliberation_id: DeliberationId(1),
            user_id: UserId::from(user),
            idea_id: IdeaId(idea),
            xp_points: xp,
            cast_at: 0,
        }
    }

    fn ids(raw: &[u64]) -> Vec<IdeaId> {
        raw.iter().copied().map(IdeaId).collect()
    }

    #[test]
    fn sums_xp_per_idea() {
        let tally = Tally::from_votes(
            &ids(&[1, 2]),
            &[vote("a", 1, 7), vote("a", 2, 3), vote("b", 1, 10)],
        );
        assert_eq!(tally.xp(&IdeaId(1)), 17);
        assert_eq!(tally.xp(&IdeaId(2)), 3);
        assert_eq!(tally.voter_count(), 2);
        assert_eq!(tally.total_xp(), 20);
    }

    #[test]
    fn ignores_votes_outside_idea_set() {
        let tally = Tally::from_votes(&ids(&[1]), &[vote("a", 9, 10)]);
        assert_eq!(tally.total_xp(), 0);
        assert_eq!(tally.voter_count(), 0);
    }

    #[test]
    fn ties_share_victory() {
        // A:10, B:10, C:4 across several voters.
        let tally = Tally::from_votes(
            &ids(&[1, 2, 3]),
            &[
                vote("a", 1, 6),
                vote("a", 2, 4),
                vote("b", 2, 6),
                vote("b", 3, 4),
                vote("c", 1, 4),
            ],
        );
        let verdict = resolve_cell(&tally, 4);
        assert_eq!(verdict.winners, ids(&[1, 2]));
        assert_eq!(verdict.losers, ids(&[3]));
        assert!(!verdict.all_tied);
    }

    #[test]
    fn no_votes_means_everyone_advances() {
        let tally = Tally::new(&ids(&[1, 2, 3]));
        let verdict = resolve_cell(&tally, 4);
        assert!(verdict.all_tied);
        assert_eq!(verdict.winners.len(), 3);
        assert!(verdict.losers.is_empty());
    }

    #[test]
    fn single_voter_below_threshold_cannot_eliminate() {
        let tally = Tally::from_votes(
            &ids(&[1, 2, 3, 4]),
            &[vote("a", 1, 3), vote("a", 2, 3), vote("a", 3, 2), vote("a", 4, 2)],
        );
        let verdict = resolve_cell(&tally, 4);
        assert!(verdict.all_tied);
    }

    #[test]
    fn single_voter_above_threshold_wins() {
        let tally = Tally::from_votes(&ids(&[1, 2]), &[vote("a", 1, 10)]);
        let verdict = resolve_cell(&tally, 4);
        assert_eq!(verdict.winners, ids(&[1]));
        assert_eq!(verdict.losers, ids(&[2]));
    }

    #[test]
    fn multi_voter_has_no_threshold() {
        let tally = Tally::from_votes(&ids(&[1, 2]), &[vote("a", 1, 1), vote("b", 2, 2)]);
        assert_eq!(tally.threshold(4), 0);
        assert_eq!(resolve_cell(&tally, 4).winners, ids(&[2]));
    }

    #[test]
    fn single_winner_draws_among_tied() {
        let tally = Tally::from_votes(
            &ids(&[1, 2, 3]),
            &[vote("a", 1, 10), vote("b", 2, 10)],
        );
        let mut rng = StdRng::seed_from_u64(7);
        let verdict = resolve_batch(&tally, 4, &mut rng).unwrap();
        assert!(verdict.winner == IdeaId(1) || verdict.winner == IdeaId(2));
        assert_eq!(verdict.drawn_from, ids(&[1, 2]));
        assert_eq!(verdict.losers.len(), 2);
        assert!(verdict.losers.contains(&IdeaId(3)));
    }

    #[test]
    fn single_winner_clear_leader() {
        let tally = Tally::from_votes(
            &ids(&[1, 2]),
            &[vote("a", 1, 10), vote("b", 1, 6), vote("b", 2, 4)],
        );
        let mut rng = StdRng::seed_from_u64(1);
        let verdict = resolve_batch(&tally, 4, &mut rng).unwrap();
        assert_eq!(verdict.winner, IdeaId(1));
        assert_eq!(verdict.losers, ids(&[2]));
    }

    #[test]
    fn single_winner_empty_set() {
        let tally = Tally::new(&[]);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(resolve_batch(&tally, 4, &mut rng).is_none());
    }
}
