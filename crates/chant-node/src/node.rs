//! Node composition and scheduler loop.
//!
//! The [`Node`] wires a [`RocksStore`], the [`TracingNotifier`] and (when
//! subscribers are configured) the webhook dispatcher into an [`Engine`],
//! then drives the engine's timers: every sweep interval it applies expired
//! timeouts and drains deferred follow-up work. Engine calls are blocking
//! RocksDB work, so each tick runs on the blocking pool.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chant_core::traits::{EventSink, NullSink};
use chant_engine::{Engine, SweepReport};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::notifier::TracingNotifier;
use crate::storage::RocksStore;
use crate::webhook::{SubscriberStatus, WebhookDispatcher};

/// Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What one scheduler tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sweep: SweepReport,
    pub follow_ups: usize,
}

/// A running Chant host.
pub struct Node {
    engine: Arc<Engine>,
    store: Arc<RocksStore>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    webhook_task: Mutex<Option<JoinHandle<()>>>,
    config: NodeConfig,
}

impl Node {
    /// Open storage and assemble the engine.
    ///
    /// Must be called inside a tokio runtime when webhooks are configured,
    /// since the delivery task is spawned here.
    pub async fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let store = Arc::new(RocksStore::open(config.db_path())?);

        let mut webhooks = None;
        let mut webhook_task = None;
        let sink: Arc<dyn EventSink> = if config.webhooks.is_empty() {
            Arc::new(NullSink)
        } else {
            let dispatcher = Arc::new(WebhookDispatcher::new(
                &config.webhooks,
                config.webhook_max_failures,
                config.webhook_timeout(),
            )?);
            let (sink, task) = Arc::clone(&dispatcher).spawn();
            webhooks = Some(dispatcher);
            webhook_task = Some(task);
            Arc::new(sink)
        };

        let engine = Engine::new(
            store.clone(),
            Arc::new(TracingNotifier),
            sink,
            config.engine.clone(),
        );
        info!(
            db = ?config.db_path(),
            webhooks = config.webhooks.len(),
            sweep_ms = config.sweep_interval_ms,
            "node initialized"
        );

        Ok(Arc::new(Self {
            engine: Arc::new(engine),
            store,
            webhooks,
            webhook_task: Mutex::new(webhook_task),
            config,
        }))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn store(&self) -> &Arc<RocksStore> {
        &self.store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Delivery health of each webhook subscriber.
    pub fn webhook_status(&self) -> Vec<SubscriberStatus> {
        self.webhooks
            .as_ref()
            .map(|w| w.status())
            .unwrap_or_default()
    }

    /// Apply expired timers as of now, then drain follow-up work.
    pub async fn tick(&self) -> Result<TickReport, NodeError> {
        let engine = Arc::clone(&self.engine);
        let report = tokio::task::spawn_blocking(move || -> Result<TickReport, NodeError> {
            let sweep = engine.sweep_timeouts(unix_millis())?;
            let follow_ups = engine.run_follow_ups()?;
            Ok(TickReport { sweep, follow_ups })
        })
        .await??;
        if report.follow_ups > 0 {
            debug!(follow_ups = report.follow_ups, "follow-ups drained");
        }
        Ok(report)
    }

    /// Run the scheduler loop forever. Tick failures are logged and retried.
    pub async fn run(self: &Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(every = ?self.config.sweep_interval(), "scheduler running");
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// Flush storage and stop webhook delivery.
    pub fn shutdown(&self) -> Result<(), NodeError> {
        if let Some(task) = self.webhook_task.lock().take() {
            task.abort();
        }
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "flush on shutdown failed");
            return Err(e.into());
        }
        info!("node stopped");
        Ok(())
    }
}
