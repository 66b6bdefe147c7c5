//! Collaborator doubles for tests.
//!
//! Enabled for this crate's own tests and, via the `testing` feature, for
//! downstream test suites.

use parking_lot::Mutex;

use crate::error::NotifyError;
use crate::events::EngineEvent;
use crate::traits::{EventSink, NotificationKind, Notifier};
use crate::types::{DeliberationId, UserId};

/// A notification captured by [`RecordingNotifier`].
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    Members {
        deliberation: DeliberationId,
        kind: NotificationKind,
        data: serde_json::Value,
    },
    User {
        user: UserId,
        kind: NotificationKind,
        data: serde_json::Value,
    },
}

impl Recorded {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Self::Members { kind, .. } | Self::User { kind, .. } => *kind,
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Recorded>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Recorded> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.sent.lock().iter().filter(|r| r.kind() == kind).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify_deliberation_members(
        &self,
        deliberation: DeliberationId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.sent.lock().push(Recorded::Members {
            deliberation,
            kind,
            data,
        });
        Ok(())
    }

    fn notify_user(
        &self,
        user: &UserId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.sent.lock().push(Recorded::User {
            user: user.clone(),
            kind,
            data,
        });
        Ok(())
    }
}

/// Notifier and sink that always fail.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingNotifier;

impl Notifier for FailingNotifier {
    fn notify_deliberation_members(
        &self,
        _deliberation: DeliberationId,
        _kind: NotificationKind,
        _data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Err(NotifyError::Unavailable)
    }

    fn notify_user(
        &self,
        _user: &UserId,
        _kind: NotificationKind,
        _data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("refused".into()))
    }
}

impl EventSink for FailingNotifier {
    fn publish(&self, _event: &EngineEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Unavailable)
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    /// Number of recorded events matching `pred`.
    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: &EngineEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
