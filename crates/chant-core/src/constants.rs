//! Engine constants. All durations are in milliseconds.

/// Smallest viable cell. Cells below this size are only produced for
/// degenerate deliberations with fewer than three participants.
pub const MIN_CELL_SIZE: usize = 3;

/// Largest configurable target cell size.
pub const MAX_CELL_SIZE: usize = 7;

/// Target cell size when none is configured.
pub const DEFAULT_CELL_SIZE: usize = 5;

/// XP points every ballot must distribute across the ideas of its cell.
pub const VOTE_POINTS: u32 = 10;

/// Minimum XP an idea needs to win a cell that had at most one voter.
///
/// Stops a lone voter from trivially pushing their own idea forward.
pub const MIN_XP_TO_ADVANCE: u64 = 4;

/// Advancing-idea counts in `BACKFILL_MIN_ADVANCING..=BACKFILL_MAX_ADVANCING`
/// are topped up to [`BACKFILL_TARGET`] with the best eliminated ideas.
pub const BACKFILL_MIN_ADVANCING: usize = 2;

/// Upper bound of the backfill trigger range.
pub const BACKFILL_MAX_ADVANCING: usize = 4;

/// Idea count a backfilled final round aims for.
pub const BACKFILL_TARGET: usize = 5;

/// Ties at the backfill cutoff are all admitted while the round stays within this size.
pub const BACKFILL_TIE_CEILING: usize = 7;

/// Members required before a batch-mode deliberation may start voting.
pub const MIN_BATCH_MEMBERS: usize = 3;

/// Pending challengers required to open a challenge round.
pub const MIN_CHALLENGERS: usize = 2;

/// Maximum question length in bytes.
pub const MAX_QUESTION_LEN: usize = 500;

/// Maximum idea text length in bytes.
pub const MAX_IDEA_TEXT_LEN: usize = 1000;

/// Maximum comment length in bytes.
pub const MAX_COMMENT_LEN: usize = 2000;

/// Voting timeout sentinel meaning "no timer": cells complete only on full
/// participation or facilitator action.
pub const NO_TIMER: u64 = 0;

/// Default per-cell voting window (one hour).
pub const DEFAULT_VOTING_TIMEOUT_MS: u64 = 60 * 60 * 1000;

/// Default accumulation window after a champion is declared (one day).
pub const DEFAULT_ACCUMULATION_MS: u64 = 24 * 60 * 60 * 1000;
