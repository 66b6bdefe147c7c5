//! Collaborator interfaces consumed by the engine.
//!
//! - [`Notifier`]: member and user notifications (push, email, ...)
//! - [`EventSink`]: receives [`EngineEvent`]s after they commit
//!
//! Both are fire-and-forget from the engine's point of view: a failing
//! collaborator is logged and never rolls back a state transition.

use serde::{Deserialize, Serialize};

use crate::error::NotifyError;
use crate::events::EngineEvent;
use crate::types::{DeliberationId, UserId};

/// Notification template selector.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A cell the recipient sits in (or may enter) opened.
    CellReady,
    VotingStarted,
    TierComplete,
    ChampionDeclared,
    AccumulationOpened,
    ChallengeRoundStarted,
    PredictionResolved,
}

/// Outbound notifications.
pub trait Notifier: Send + Sync {
    fn notify_deliberation_members(
        &self,
        deliberation: DeliberationId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError>;

    fn notify_user(
        &self,
        user: &UserId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Consumer of the engine's audit stream.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &EngineEvent) -> Result<(), NotifyError>;
}

/// Notifier that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify_deliberation_members(
        &self,
        _deliberation: DeliberationId,
        _kind: NotificationKind,
        _data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Ok(())
    }

    fn notify_user(
        &self,
        _user: &UserId,
        _kind: NotificationKind,
        _data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Event sink that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &EngineEvent) -> Result<(), NotifyError> {
        Ok(())
    }
}
