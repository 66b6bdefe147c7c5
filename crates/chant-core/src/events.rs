//! Engine audit events.
//!
//! The engine publishes one [`EngineEvent`] per authoritative state change,
//! after the change has committed. Sinks receive them in commit order per
//! caller; there is no global ordering across concurrent callers.

use serde::{Deserialize, Serialize};

use crate::types::{CellId, DeliberationId, IdeaId, Phase, UserId};

/// Authoritative state change recorded by the engine.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    DeliberationCreated {
        deliberation: DeliberationId,
        creator: UserId,
        cell_size: u32,
    },
    IdeaSubmitted {
        deliberation: DeliberationId,
        idea: IdeaId,
        author: Option<UserId>,
        /// Submitted as a challenger to a standing champion.
        challenger: bool,
    },
    CellCreated {
        deliberation: DeliberationId,
        cell: CellId,
        tier: u32,
        batch: Option<u32>,
        ideas: Vec<IdeaId>,
    },
    VoteCast {
        deliberation: DeliberationId,
        cell: CellId,
        user: UserId,
    },
    CellCompleted {
        deliberation: DeliberationId,
        cell: CellId,
        tier: u32,
        by_timeout: bool,
        /// Empty while the cell's batch is still pending.
        winners: Vec<IdeaId>,
    },
    TierCompleted {
        deliberation: DeliberationId,
        tier: u32,
        advancing: Vec<IdeaId>,
        /// XP earned during this tier by every idea contested in it.
        xp_totals: Vec<(IdeaId, u64)>,
    },
    ChampionDeclared {
        deliberation: DeliberationId,
        idea: IdeaId,
        /// Hex-encoded BLAKE3 digest of the idea text.
        text_hash: String,
        total_tiers: u32,
        total_voters: u32,
    },
    PhaseChanged {
        deliberation: DeliberationId,
        from: Phase,
        to: Phase,
    },
}

impl EngineEvent {
    pub fn deliberation(&self) -> DeliberationId {
        match self {
            Self::DeliberationCreated { deliberation, .. }
            | Self::IdeaSubmitted { deliberation, .. }
            | Self::CellCreated { deliberation, .. }
            | Self::VoteCast { deliberation, .. }
            | Self::CellCompleted { deliberation, .. }
            | Self::TierCompleted { deliberation, .. }
            | Self::ChampionDeclared { deliberation, .. }
            | Self::PhaseChanged { deliberation, .. } => *deliberation,
        }
    }

    /// Webhook event kind this event is delivered as, if any.
    pub fn webhook_kind(&self) -> Option<WebhookEventKind> {
        match self {
            Self::IdeaSubmitted { .. } => Some(WebhookEventKind::IdeaSubmitted),
            Self::VoteCast { .. } => Some(WebhookEventKind::VoteCast),
            Self::TierCompleted { .. } => Some(WebhookEventKind::TierComplete),
            Self::ChampionDeclared { .. } => Some(WebhookEventKind::WinnerDeclared),
            _ => None,
        }
    }
}

/// Event kinds exposed to webhook subscribers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    IdeaSubmitted,
    VoteCast,
    TierComplete,
    WinnerDeclared,
}

impl WebhookEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdeaSubmitted => "idea_submitted",
            Self::VoteCast => "vote_cast",
            Self::TierComplete => "tier_complete",
            Self::WinnerDeclared => "winner_declared",
        }
    }
}
