//! # chant-node
//! Host composition for the Chant engine: RocksDB storage, webhooks and the scheduler.
//!
//! Runs the Chant engine as a long-lived process:
//! - [`storage::RocksStore`]: persistent deliberation store backed by RocksDB
//! - [`webhook::WebhookDispatcher`]: signed, best-effort event delivery
//! - [`notifier::TracingNotifier`]: notifications routed to structured logs
//! - [`node::Node`]: engine assembly and the timeout/follow-up scheduler
//! - [`config::NodeConfig`]: node configuration

pub mod config;
pub mod error;
pub mod node;
pub mod notifier;
pub mod storage;
pub mod webhook;

pub use config::{NodeConfig, WebhookSubscriber};
pub use error::NodeError;
pub use node::{Node, TickReport};
pub use notifier::TracingNotifier;
pub use storage::RocksStore;
pub use webhook::{WebhookDispatcher, WebhookSink};
