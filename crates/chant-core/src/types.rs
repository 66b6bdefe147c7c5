//! Core entity types: deliberations, ideas, cells, votes, predictions, comments.
//!
//! Identifiers are allocated by the store
//! ([`DeliberationStore::next_id`](crate::store::DeliberationStore::next_id))
//! and increase monotonically, so ordering by id is ordering by creation.
//! All timestamps are unix milliseconds.
//!
//! Every status enum carries its legal edges: `can_transition_to` answers
//! whether an edge exists and `transition` returns a [`TransitionError`] for
//! anything else, so engine code never writes an unchecked status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_ACCUMULATION_MS, DEFAULT_CELL_SIZE, DEFAULT_VOTING_TIMEOUT_MS};
use crate::error::TransitionError;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
            bincode::Encode, bincode::Decode,
        )]
        pub struct $name(pub u64);

        impl $name {
            /// Big-endian bytes, used for ordered storage keys.
            pub fn to_be_bytes(self) -> [u8; 8] {
                self.0.to_be_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a [`Deliberation`].
    DeliberationId,
    "dlb"
);
numeric_id!(
    /// Identifier of an [`Idea`].
    IdeaId,
    "idea"
);
numeric_id!(
    /// Identifier of a [`Cell`].
    CellId,
    "cell"
);
numeric_id!(
    /// Identifier of a [`Comment`].
    CommentId,
    "cmt"
);
numeric_id!(
    /// Identifier of a [`Prediction`].
    PredictionId,
    "pred"
);

/// An externally authenticated user. Authentication is not this crate's concern.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Deliberation
// ---------------------------------------------------------------------------

/// Deliberation lifecycle phase.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode,
    bincode::Decode,
)]
pub enum Phase {
    /// Accepting ideas; no cells exist yet.
    Submission,
    /// Cells are discussing and voting.
    Voting,
    /// A champion stands and challenger ideas are being collected.
    Accumulating,
    /// Terminal.
    Completed,
}

impl Phase {
    /// Whether `self -> next` is a legal phase edge.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Submission, Voting)
                | (Submission, Completed)
                | (Submission, Accumulating)
                | (Voting, Completed)
                | (Voting, Accumulating)
                | (Accumulating, Voting)
                | (Accumulating, Completed)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: Phase) -> Result<Phase, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Phase { from: self, to: next })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submission => "SUBMISSION",
            Self::Voting => "VOTING",
            Self::Accumulating => "ACCUMULATING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How tier-1 (and later) cells get their members.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum AllocationMode {
    /// Members are pre-seated when cells are created.
    #[default]
    Batch,
    /// Cells are created with ideas only; members self-assign by entering.
    Fcfs,
}

/// Creation-time parameters of a deliberation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DeliberationSettings {
    /// Target members per cell (3..=7). In FCFS mode also the number of
    /// distinct voters that completes a cell and the idea-group size.
    pub cell_size: u32,
    pub allocation_mode: AllocationMode,
    /// Form next-tier cells incrementally instead of at tier boundaries.
    pub continuous_flow: bool,
    /// After a champion is declared, accept challengers instead of completing.
    pub accumulation_enabled: bool,
    /// Fast mode: one cell, its winner is the champion.
    pub single_cell: bool,
    /// Voting window per cell; [`NO_TIMER`](crate::constants::NO_TIMER) disables it.
    pub voting_timeout_ms: u64,
    /// Optional discussion window before voting opens. `None` or zero skips it.
    pub discussion_duration_ms: Option<u64>,
    /// Accumulation window after a champion is declared.
    pub accumulation_duration_ms: u64,
}

impl Default for DeliberationSettings {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE as u32,
            allocation_mode: AllocationMode::Batch,
            continuous_flow: false,
            accumulation_enabled: false,
            single_cell: false,
            voting_timeout_ms: DEFAULT_VOTING_TIMEOUT_MS,
            discussion_duration_ms: None,
            accumulation_duration_ms: DEFAULT_ACCUMULATION_MS,
        }
    }
}

impl DeliberationSettings {
    /// Discussion window, if one is configured and non-zero.
    pub fn discussion_window(&self) -> Option<u64> {
        self.discussion_duration_ms.filter(|ms| *ms > 0)
    }

    pub fn cell_size(&self) -> usize {
        self.cell_size as usize
    }
}

/// One voting campaign.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Deliberation {
    pub id: DeliberationId,
    pub question: String,
    pub creator: UserId,
    pub settings: DeliberationSettings,
    pub phase: Phase,
    /// Tier currently being contested. 0 until voting starts; only increases.
    pub current_tier: u32,
    /// First tier of the current round (1 for the opening round; challenge
    /// rounds continue numbering from where the previous round stopped).
    pub round_start_tier: u32,
    /// Number of challenge rounds started so far.
    pub challenge_round: u32,
    pub champion_id: Option<IdeaId>,
    /// Tier at which the defending champion re-entered the current round.
    pub champion_entered_tier: Option<u32>,
    pub accumulation_ends_at: Option<u64>,
    /// Continuous flow: facilitator closed idea intake for the round.
    pub submissions_closed: bool,
    pub created_at: u64,
}

impl Deliberation {
    pub fn cell_size(&self) -> usize {
        self.settings.cell_size()
    }

    pub fn is_continuous(&self) -> bool {
        self.settings.continuous_flow
    }

    pub fn is_fcfs(&self) -> bool {
        self.settings.allocation_mode == AllocationMode::Fcfs
    }
}

// ---------------------------------------------------------------------------
// Idea
// ---------------------------------------------------------------------------

/// Idea lifecycle status.
///
/// Elimination is single-strike: a losing idea goes straight to
/// [`Eliminated`](IdeaStatus::Eliminated).
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode,
    bincode::Decode,
)]
pub enum IdeaStatus {
    /// In the pool, not yet assigned to a cell.
    Submitted,
    /// Challenger submitted while a champion stands.
    Pending,
    /// Contested by an open cell at `tier`.
    InVoting,
    /// Won its cell (or batch) at `tier`; waiting for the next tier.
    Advancing,
    Eliminated,
    /// Champion of a completed round.
    Winner,
    /// Former champion sitting out the early tiers of a challenge round.
    Defending,
    /// Challenger that could not form a challenge round.
    Benched,
    /// Eliminated in an earlier round; out of play for good.
    Retired,
}

impl IdeaStatus {
    /// Whether `self -> next` is a legal idea edge.
    pub fn can_transition_to(self, next: IdeaStatus) -> bool {
        use IdeaStatus::*;
        matches!(
            (self, next),
            (Submitted, InVoting)
                | (Submitted, Advancing)
                | (Submitted, Winner)
                | (Pending, Submitted)
                | (Pending, Benched)
                | (InVoting, Advancing)
                | (InVoting, Eliminated)
                | (InVoting, Winner)
                | (Advancing, InVoting)
                | (Advancing, Advancing)
                | (Advancing, Winner)
                | (Eliminated, Advancing)
                | (Eliminated, Retired)
                | (Winner, Defending)
                | (Defending, Advancing)
        )
    }

    /// Checked transition.
    pub fn transition(self, next: IdeaStatus) -> Result<IdeaStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Idea { from: self, to: next })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Pending => "PENDING",
            Self::InVoting => "IN_VOTING",
            Self::Advancing => "ADVANCING",
            Self::Eliminated => "ELIMINATED",
            Self::Winner => "WINNER",
            Self::Defending => "DEFENDING",
            Self::Benched => "BENCHED",
            Self::Retired => "RETIRED",
        }
    }
}

impl fmt::Display for IdeaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A proposal contesting the deliberation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Idea {
    pub id: IdeaId,
    pub deliberation_id: DeliberationId,
    pub text: String,
    /// `None` for anonymous or generated submissions.
    pub author: Option<UserId>,
    pub status: IdeaStatus,
    /// Tier currently (or last) contested.
    pub tier: u32,
    /// XP accumulated over every cell this idea sat in.
    pub total_xp: u64,
    pub losses: u32,
    pub is_champion: bool,
    pub created_at: u64,
}

impl Idea {
    /// Apply a checked status edge in place.
    pub fn set_status(&mut self, next: IdeaStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    /// BLAKE3 digest of the idea text, recorded with champion declarations.
    pub fn text_hash(&self) -> [u8; 32] {
        blake3::hash(self.text.as_bytes()).into()
    }

    pub fn text_hash_hex(&self) -> String {
        hex::encode(self.text_hash())
    }
}

// ---------------------------------------------------------------------------
// Cell
// ---------------------------------------------------------------------------

/// Cell lifecycle status.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode,
    bincode::Decode,
)]
pub enum CellStatus {
    Deliberating,
    Voting,
    Completed,
}

impl CellStatus {
    pub fn can_transition_to(self, next: CellStatus) -> bool {
        use CellStatus::*;
        matches!(
            (self, next),
            (Deliberating, Voting) | (Deliberating, Completed) | (Voting, Completed)
        )
    }

    pub fn transition(self, next: CellStatus) -> Result<CellStatus, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Cell { from: self, to: next })
        }
    }

    pub fn is_open(self) -> bool {
        self != CellStatus::Completed
    }
}

impl fmt::Display for CellStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deliberating => "DELIBERATING",
            Self::Voting => "VOTING",
            Self::Completed => "COMPLETED",
        })
    }
}

/// A bounded discussion/voting group for one tier.
///
/// `idea_ids` is fixed at creation (kept sorted) and never mutated.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Cell {
    pub id: CellId,
    pub deliberation_id: DeliberationId,
    pub tier: u32,
    /// Cells sharing a batch index at the same tier vote on one idea set.
    pub batch: Option<u32>,
    pub status: CellStatus,
    pub idea_ids: Vec<IdeaId>,
    pub discussion_ends_at: Option<u64>,
    pub voting_deadline: Option<u64>,
    /// Set on the first zero-vote timeout (the one-time extension) and on
    /// timeout-driven completion.
    pub completed_by_timeout: bool,
    pub created_at: u64,
    pub completed_at: Option<u64>,
}

impl Cell {
    pub fn set_status(&mut self, next: CellStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    pub fn contains(&self, idea: &IdeaId) -> bool {
        self.idea_ids.binary_search(idea).is_ok()
    }

    /// Whether both cells vote on exactly the same ideas.
    pub fn same_ideas(&self, other: &Cell) -> bool {
        self.idea_ids == other.idea_ids
    }
}

/// Seating status of a member in a cell.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode,
    bincode::Decode,
)]
pub enum ParticipationStatus {
    Active,
    Voted,
}

/// A member seated in a cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CellParticipation {
    pub cell_id: CellId,
    pub deliberation_id: DeliberationId,
    pub user_id: UserId,
    pub status: ParticipationStatus,
    pub joined_at: u64,
}

/// One XP allocation of a member's ballot. A ballot is the set of a
/// member's votes in one cell; casting again replaces the whole set.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Vote {
    pub cell_id: CellId,
    pub deliberation_id: DeliberationId,
    pub user_id: UserId,
    pub idea_id: IdeaId,
    pub xp_points: u32,
    pub cast_at: u64,
}

// ---------------------------------------------------------------------------
// Predictions, comments, user stats
// ---------------------------------------------------------------------------

/// What a prediction bets on.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode,
    bincode::Decode,
)]
pub enum PredictionScope {
    /// The idea will win this cell.
    Cell(CellId),
    /// The idea will become the deliberation's champion.
    Deliberation,
}

/// A user's bet on an idea. Outcome fields are write-once.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Prediction {
    pub id: PredictionId,
    pub deliberation_id: DeliberationId,
    pub user_id: UserId,
    pub scope: PredictionScope,
    pub idea_id: IdeaId,
    pub won: Option<bool>,
    pub became_champion: bool,
    pub final_tier: Option<u32>,
    pub created_at: u64,
    pub resolved_at: Option<u64>,
}

/// Cell-scoped discussion text.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Comment {
    pub id: CommentId,
    pub deliberation_id: DeliberationId,
    pub cell_id: CellId,
    /// Idea the comment is about, if any. Only attached comments up-pollinate.
    pub idea_id: Option<IdeaId>,
    pub author: UserId,
    pub text: String,
    pub upvote_count: u32,
    /// Number of cells the comment has been shown in beyond its own.
    pub spread_count: u32,
    /// Highest tier the comment has been promoted into.
    pub reach_tier: u32,
    pub created_at: u64,
}

/// Per-user prediction bookkeeping.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default, bincode::Encode,
    bincode::Decode,
)]
pub struct UserStats {
    pub user_id: UserId,
    pub current_streak: u32,
    pub best_streak: u32,
    pub correct_predictions: u32,
    pub total_predictions: u32,
    pub champion_picks: u32,
}

impl UserStats {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            ..Self::default()
        }
    }

    /// Record a resolved cell prediction.
    pub fn record(&mut self, won: bool) {
        self.total_predictions += 1;
        if won {
            self.correct_predictions += 1;
            self.current_streak += 1;
            self.best_streak = self.best_streak.max(self.current_streak);
        } else {
            self.current_streak = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_with(ideas: &[u64]) -> Cell {
        Cell {
            id: CellId(1),
            deliberation_id: DeliberationId(1),
            tier: 1,
            batch: None,
            status: CellStatus::Voting,
            idea_ids: ideas.iter().copied().map(IdeaId).collect(),
            discussion_ends_at: None,
            voting_deadline: None,
            completed_by_timeout: false,
            created_at: 0,
            completed_at: None,
        }
    }

    #[test]
    fn phase_edges() {
        assert!(Phase::Submission.can_transition_to(Phase::Voting));
        assert!(Phase::Voting.can_transition_to(Phase::Accumulating));
        assert!(Phase::Accumulating.can_transition_to(Phase::Voting));
        assert!(!Phase::Completed.can_transition_to(Phase::Voting));
        assert!(!Phase::Voting.can_transition_to(Phase::Submission));
    }

    #[test]
    fn phase_transition_error_names_both_ends() {
        let err = Phase::Completed.transition(Phase::Voting).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Phase {
                from: Phase::Completed,
                to: Phase::Voting
            }
        );
        assert!(err.to_string().contains("COMPLETED"));
    }

    #[test]
    fn idea_edges_follow_elimination_flow() {
        use IdeaStatus::*;
        assert!(Submitted.can_transition_to(InVoting));
        assert!(InVoting.can_transition_to(Advancing));
        assert!(InVoting.can_transition_to(Eliminated));
        assert!(Advancing.can_transition_to(InVoting));
        assert!(Eliminated.can_transition_to(Advancing));
        assert!(Winner.can_transition_to(Defending));
        assert!(!Eliminated.can_transition_to(InVoting));
        assert!(!Winner.can_transition_to(Eliminated));
        assert!(!Retired.can_transition_to(Advancing));
    }

    #[test]
    fn idea_set_status_rejects_illegal_edge() {
        let mut idea = Idea {
            id: IdeaId(1),
            deliberation_id: DeliberationId(1),
            text: "plant trees".into(),
            author: None,
            status: IdeaStatus::Eliminated,
            tier: 1,
            total_xp: 0,
            losses: 1,
            is_champion: false,
            created_at: 0,
        };
        assert!(idea.set_status(IdeaStatus::Winner).is_err());
        assert_eq!(idea.status, IdeaStatus::Eliminated);
        idea.set_status(IdeaStatus::Advancing).unwrap();
        assert_eq!(idea.status, IdeaStatus::Advancing);
    }

    #[test]
    fn cell_edges() {
        assert!(CellStatus::Deliberating.can_transition_to(CellStatus::Voting));
        assert!(CellStatus::Voting.can_transition_to(CellStatus::Completed));
        assert!(!CellStatus::Completed.can_transition_to(CellStatus::Voting));
        assert!(!CellStatus::Completed.is_open());
    }

    #[test]
    fn cell_same_ideas_and_contains() {
        let a = cell_with(&[1, 2, 3]);
        let b = cell_with(&[1, 2, 3]);
        let c = cell_with(&[1, 2, 4]);
        assert!(a.same_ideas(&b));
        assert!(!a.same_ideas(&c));
        assert!(a.contains(&IdeaId(2)));
        assert!(!a.contains(&IdeaId(4)));
    }

    #[test]
    fn user_stats_streaks() {
        let mut stats = UserStats::new(UserId::from("ana"));
        stats.record(true);
        stats.record(true);
        stats.record(false);
        stats.record(true);
        assert_eq!(stats.current_streak, 1);
        assert_eq!(stats.best_streak, 2);
        assert_eq!(stats.correct_predictions, 3);
        assert_eq!(stats.total_predictions, 4);
    }

    #[test]
    fn id_display() {
        assert_eq!(DeliberationId(7).to_string(), "dlb-7");
        assert_eq!(IdeaId(3).to_string(), "idea-3");
        assert_eq!(CellId(9).to_string(), "cell-9");
    }

    #[test]
    fn discussion_window_ignores_zero() {
        let mut s = DeliberationSettings::default();
        assert_eq!(s.discussion_window(), None);
        s.discussion_duration_ms = Some(0);
        assert_eq!(s.discussion_window(), None);
        s.discussion_duration_ms = Some(500);
        assert_eq!(s.discussion_window(), Some(500));
    }

    #[test]
    fn text_hash_is_blake3_of_text() {
        let idea = Idea {
            id: IdeaId(1),
            deliberation_id: DeliberationId(1),
            text: "bike lanes".into(),
            author: None,
            status: IdeaStatus::Winner,
            tier: 2,
            total_xp: 20,
            losses: 0,
            is_champion: true,
            created_at: 0,
        };
        let expected: [u8; 32] = blake3::hash(b"bike lanes").into();
        assert_eq!(idea.text_hash(), expected);
    }
}
