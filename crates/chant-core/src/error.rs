//! Error types for the Chant engine.
//!
//! Race losses on conditional claims are not errors; they are reported as
//! outcome variants by the engine. Everything here is a real failure.
use thiserror::Error;

use crate::types::{CellId, CellStatus, CommentId, DeliberationId, IdeaId, IdeaStatus, Phase};

/// Caller-visible precondition violations. The deliberation is left unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("deliberation not found: {0}")] DeliberationNotFound(DeliberationId),
    #[error("cell not found: {0}")] CellNotFound(CellId),
    #[error("idea not found: {0}")] IdeaNotFound(IdeaId),
    #[error("comment not found: {0}")] CommentNotFound(CommentId),
    #[error("wrong phase: expected {expected}, found {actual}")] WrongPhase { expected: Phase, actual: Phase },
    #[error("no ideas submitted")] NoIdeas,
    #[error("insufficient participants: have {have}, need {need}")] InsufficientParticipants { have: usize, need: usize },
    #[error("cell size {0} outside 3..=7")] InvalidCellSize(u32),
    #[error("ballot must allocate exactly {expected} points, got {got}")] InvalidPointTotal { got: u32, expected: u32 },
    #[error("text too long: {len} > {max}")] TextTooLong { len: usize, max: usize },
    #[error("empty text")] EmptyText,
    #[error("user is not a member of {0}")] NotAMember(DeliberationId),
    #[error("user already seated in {0}")] AlreadySeated(CellId),
    #[error("user is not seated in {0}")] NotSeated(CellId),
    #[error("cell is full: {0}")] CellFull(CellId),
    #[error("no open cell to enter")] NoOpenCell,
    #[error("idea {idea} is not contested in {cell}")] IdeaNotInCell { idea: IdeaId, cell: CellId },
    #[error("submissions are closed")] SubmissionsClosed,
    #[error("cell is closed: {0}")] CellClosed(CellId),
    #[error("voting has not opened in {0}")] VotingNotOpen(CellId),
    #[error("prediction already placed")] AlreadyPredicted,
    #[error("operation requires continuous flow")] NotContinuous,
}

impl PreconditionError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DeliberationNotFound(_) => "DELIBERATION_NOT_FOUND",
            Self::CellNotFound(_) => "CELL_NOT_FOUND",
            Self::IdeaNotFound(_) => "IDEA_NOT_FOUND",
            Self::CommentNotFound(_) => "COMMENT_NOT_FOUND",
            Self::WrongPhase { .. } => "WRONG_PHASE",
            Self::NoIdeas => "NO_IDEAS",
            Self::InsufficientParticipants { .. } => "INSUFFICIENT_PARTICIPANTS",
            Self::InvalidCellSize(_) => "INVALID_CELL_SIZE",
            Self::InvalidPointTotal { .. } => "INVALID_POINT_TOTAL",
            Self::TextTooLong { .. } => "TEXT_TOO_LONG",
            Self::EmptyText => "EMPTY_TEXT",
            Self::NotAMember(_) => "NOT_A_MEMBER",
            Self::AlreadySeated(_) => "ALREADY_SEATED",
            Self::NotSeated(_) => "NOT_SEATED",
            Self::CellFull(_) => "CELL_FULL",
            Self::NoOpenCell => "NO_OPEN_CELL",
            Self::IdeaNotInCell { .. } => "IDEA_NOT_IN_CELL",
            Self::SubmissionsClosed => "SUBMISSIONS_CLOSED",
            Self::CellClosed(_) => "CELL_CLOSED",
            Self::VotingNotOpen(_) => "VOTING_NOT_OPEN",
            Self::AlreadyPredicted => "ALREADY_PREDICTED",
            Self::NotContinuous => "NOT_CONTINUOUS",
        }
    }
}

/// An attempted status edge that the state machines forbid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal phase transition {from} -> {to}")] Phase { from: Phase, to: Phase },
    #[error("illegal idea transition {from} -> {to}")] Idea { from: IdeaStatus, to: IdeaStatus },
    #[error("illegal cell transition {from} -> {to}")] Cell { from: CellStatus, to: CellStatus },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("backend: {0}")] Backend(String),
    #[error("codec: {0}")] Codec(String),
    #[error("missing row: {0}")] Missing(String),
}

/// Delivery failure of a side-effect collaborator. Never escapes the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("delivery failed: {0}")] Delivery(String),
    #[error("collaborator unavailable")] Unavailable,
}

#[derive(Error, Debug)]
pub enum ChantError {
    #[error(transparent)] Precondition(#[from] PreconditionError),
    #[error(transparent)] Transition(#[from] TransitionError),
    #[error(transparent)] Store(#[from] StoreError),
}

impl ChantError {
    /// Reason code when this is a precondition violation.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Precondition(e) => Some(e.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_codes_are_stable() {
        assert_eq!(PreconditionError::NoIdeas.code(), "NO_IDEAS");
        assert_eq!(
            PreconditionError::InsufficientParticipants { have: 1, need: 3 }.code(),
            "INSUFFICIENT_PARTICIPANTS"
        );
        assert_eq!(
            PreconditionError::DeliberationNotFound(DeliberationId(1)).code(),
            "DELIBERATION_NOT_FOUND"
        );
    }

    #[test]
    fn chant_error_exposes_code_for_preconditions_only() {
        let err: ChantError = PreconditionError::NoIdeas.into();
        assert_eq!(err.code(), Some("NO_IDEAS"));
        let err: ChantError = StoreError::Backend("disk".into()).into();
        assert_eq!(err.code(), None);
    }

    #[test]
    fn error_variants_display() {
        let e = PreconditionError::InvalidPointTotal { got: 7, expected: 10 };
        assert_eq!(e.to_string(), "ballot must allocate exactly 10 points, got 7");
        let e = TransitionError::Cell {
            from: CellStatus::Completed,
            to: CellStatus::Voting,
        };
        assert_eq!(e.to_string(), "illegal cell transition COMPLETED -> VOTING");
    }
}
