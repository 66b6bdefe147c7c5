//! Signed, best-effort webhook delivery.
//!
//! The engine publishes events synchronously; [`WebhookSink`] only enqueues
//! them. A background task owned by [`WebhookDispatcher`] turns each event
//! with a webhook kind into a JSON payload and POSTs it to every enabled
//! subscriber. Each request carries `X-Chant-Event` and a hex BLAKE3 keyed
//! hash of the body in `X-Chant-Signature`.
//!
//! A subscriber that fails `max_failures` times in a row is disabled; any
//! success resets its counter. Failures never reach the engine.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chant_core::error::NotifyError;
use chant_core::events::{EngineEvent, WebhookEventKind};
use chant_core::traits::EventSink;
use chant_core::types::DeliberationId;

use crate::config::WebhookSubscriber;
use crate::error::NodeError;
use crate::node::unix_millis;

/// Context string for deriving signing keys from subscriber secrets.
const SIGNATURE_CONTEXT: &str = "chant 2024-06 webhook signature";

pub const SIGNATURE_HEADER: &str = "X-Chant-Signature";
pub const EVENT_HEADER: &str = "X-Chant-Event";

/// Hex BLAKE3 keyed hash of `body` under a key derived from `secret`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = blake3::derive_key(SIGNATURE_CONTEXT, secret.as_bytes());
    blake3::keyed_hash(&key, body).to_hex().to_string()
}

/// Constant-time check of a received signature.
pub fn verify(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(raw) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(expected): Result<[u8; 32], _> = raw.try_into() else {
        return false;
    };
    let key = blake3::derive_key(SIGNATURE_CONTEXT, secret.as_bytes());
    blake3::keyed_hash(&key, body) == blake3::Hash::from(expected)
}

/// Body POSTed to subscribers.
#[derive(Serialize, Debug)]
pub struct WebhookPayload<'a> {
    pub event: WebhookEventKind,
    pub deliberation: DeliberationId,
    pub timestamp: u64,
    pub data: &'a EngineEvent,
}

/// Snapshot of one subscriber's delivery health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberStatus {
    pub url: String,
    pub consecutive_failures: u32,
    pub disabled: bool,
}

struct Subscription {
    url: String,
    secret: String,
    failures: AtomicU32,
    disabled: AtomicBool,
}

/// Delivers engine events to configured webhook subscribers.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    subscriptions: Vec<Subscription>,
    max_failures: u32,
}

impl WebhookDispatcher {
    pub fn new(
        subscribers: &[WebhookSubscriber],
        max_failures: u32,
        timeout: Duration,
    ) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let subscriptions = subscribers
            .iter()
            .map(|s| Subscription {
                url: s.url.clone(),
                secret: s.secret.clone(),
                failures: AtomicU32::new(0),
                disabled: AtomicBool::new(false),
            })
            .collect();
        Ok(Self {
            client,
            subscriptions,
            max_failures: max_failures.max(1),
        })
    }

    pub fn status(&self) -> Vec<SubscriberStatus> {
        self.subscriptions
            .iter()
            .map(|s| SubscriberStatus {
                url: s.url.clone(),
                consecutive_failures: s.failures.load(Ordering::Relaxed),
                disabled: s.disabled.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Deliver one event to every enabled subscriber.
    ///
    /// Events without a webhook kind are skipped. Returns the number of
    /// successful deliveries.
    pub async fn fire_event(&self, event: &EngineEvent) -> usize {
        let Some(kind) = event.webhook_kind() else {
            return 0;
        };
        let payload = WebhookPayload {
            event: kind,
            deliberation: event.deliberation(),
            timestamp: unix_millis(),
            data: event,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode webhook payload");
                return 0;
            }
        };

        let mut delivered = 0;
        for sub in &self.subscriptions {
            if sub.disabled.load(Ordering::Relaxed) {
                continue;
            }
            match self.post(sub, kind, &body).await {
                Ok(()) => {
                    sub.failures.store(0, Ordering::Relaxed);
                    delivered += 1;
                    debug!(url = %sub.url, event = kind.as_str(), "webhook delivered");
                }
                Err(e) => {
                    let failures = sub.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(url = %sub.url, event = kind.as_str(), failures, error = %e, "webhook delivery failed");
                    if failures >= self.max_failures && !sub.disabled.swap(true, Ordering::Relaxed) {
                        warn!(url = %sub.url, failures, "webhook disabled after consecutive failures");
                    }
                }
            }
        }
        delivered
    }

    async fn post(&self, sub: &Subscription, kind: WebhookEventKind, body: &[u8]) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&sub.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, kind.as_str())
            .header(SIGNATURE_HEADER, sign(&sub.secret, body))
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }

    /// Start the delivery task. The returned sink enqueues events for it.
    ///
    /// The task ends once every [`WebhookSink`] clone has been dropped and the
    /// queue is drained.
    pub fn spawn(self: Arc<Self>) -> (WebhookSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        let handle = tokio::spawn(async move {
            info!(subscribers = self.subscriptions.len(), "webhook dispatcher started");
            while let Some(event) = rx.recv().await {
                self.fire_event(&event).await;
            }
            debug!("webhook dispatcher stopped");
        });
        (WebhookSink { tx }, handle)
    }
}

/// [`EventSink`] feeding a running [`WebhookDispatcher`].
#[derive(Clone)]
pub struct WebhookSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink for WebhookSink {
    fn publish(&self, event: &EngineEvent) -> Result<(), NotifyError> {
        if event.webhook_kind().is_none() {
            return Ok(());
        }
        self.tx
            .send(event.clone())
            .map_err(|_| NotifyError::Unavailable)
    }
}
