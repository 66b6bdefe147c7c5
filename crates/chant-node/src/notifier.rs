//! Notifier that writes notifications to the log.
//!
//! Delivery channels (push, email) live outside the node; this keeps every
//! notification visible in structured logs so an operator or log shipper can
//! pick them up.

use tracing::info;

use chant_core::error::NotifyError;
use chant_core::traits::{NotificationKind, Notifier};
use chant_core::types::{DeliberationId, UserId};

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify_deliberation_members(
        &self,
        deliberation: DeliberationId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(target: "chant::notify", deliberation = %deliberation, ?kind, %data, "notify members");
        Ok(())
    }

    fn notify_user(
        &self,
        user: &UserId,
        kind: NotificationKind,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(target: "chant::notify", user = %user, ?kind, %data, "notify user");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn never_fails() {
        let n = TracingNotifier;
        assert!(n
            .notify_deliberation_members(DeliberationId(1), NotificationKind::CellReady, json!({}))
            .is_ok());
        assert!(n
            .notify_user(&UserId::from("ana"), NotificationKind::PredictionResolved, json!({"won": true}))
            .is_ok());
    }
}
