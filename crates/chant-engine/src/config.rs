//! Engine tuning knobs.
//!
//! Per-deliberation parameters live in
//! [`DeliberationSettings`](chant_core::types::DeliberationSettings); this is
//! the engine-wide policy shared by every deliberation it runs.

use serde::{Deserialize, Serialize};

use chant_core::constants::{
    BACKFILL_MAX_ADVANCING, BACKFILL_MIN_ADVANCING, BACKFILL_TARGET, BACKFILL_TIE_CEILING,
    MIN_BATCH_MEMBERS, MIN_CHALLENGERS, MIN_XP_TO_ADVANCE, VOTE_POINTS,
};

/// Engine-wide policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// XP an idea needs to win a cell with at most one distinct voter.
    pub min_xp_to_advance: u64,
    /// Points every ballot must distribute.
    pub vote_points: u32,
    /// Backfill triggers when the advancing count is within `backfill_min..=backfill_max`.
    pub backfill_min: usize,
    pub backfill_max: usize,
    /// Idea count a backfilled round is topped up to.
    pub backfill_target: usize,
    /// Tied candidates at the cutoff are all admitted while the round stays within this.
    pub backfill_tie_ceiling: usize,
    /// Members required to start a pre-seated (batch) deliberation.
    pub min_batch_members: usize,
    /// Pending challengers required to open a challenge round.
    pub min_challengers: usize,
    /// Maximum queued follow-ups; further ones are dropped with a warning.
    pub follow_up_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_xp_to_advance: MIN_XP_TO_ADVANCE,
            vote_points: VOTE_POINTS,
            backfill_min: BACKFILL_MIN_ADVANCING,
            backfill_max: BACKFILL_MAX_ADVANCING,
            backfill_target: BACKFILL_TARGET,
            backfill_tie_ceiling: BACKFILL_TIE_CEILING,
            min_batch_members: MIN_BATCH_MEMBERS,
            min_challengers: MIN_CHALLENGERS,
            follow_up_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_min_xp_to_advance(mut self, xp: u64) -> Self {
        self.min_xp_to_advance = xp;
        self
    }

    pub fn with_vote_points(mut self, points: u32) -> Self {
        self.vote_points = points;
        self
    }

    pub fn with_min_challengers(mut self, count: usize) -> Self {
        self.min_challengers = count;
        self
    }

    pub fn with_follow_up_capacity(mut self, capacity: usize) -> Self {
        self.follow_up_capacity = capacity;
        self
    }

    /// Whether `advancing` ideas call for a backfill.
    pub fn wants_backfill(&self, advancing: usize) -> bool {
        (self.backfill_min..=self.backfill_max).contains(&advancing)
    }
}
