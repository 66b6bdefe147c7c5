//! Node configuration for the Chant host.
//!
//! Provides [`NodeConfig`] with defaults for the data directory, scheduler
//! cadence and webhook delivery. Values can be set programmatically, or
//! layered from an optional TOML file and `CHANT__*` environment variables
//! with [`NodeConfig::load`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chant_engine::EngineConfig;

/// A webhook endpoint receiving engine events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSubscriber {
    pub url: String,
    /// Shared secret keying the payload signature.
    pub secret: String,
}

/// Configuration for a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Milliseconds between timeout sweeps.
    pub sweep_interval_ms: u64,
    pub webhooks: Vec<WebhookSubscriber>,
    /// Consecutive delivery failures after which a webhook is disabled.
    pub webhook_max_failures: u32,
    /// Per-request webhook delivery timeout in milliseconds.
    pub webhook_timeout_ms: u64,
    /// Log level filter string (e.g. "info", "debug", "chant_engine=trace").
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chant");

        Self {
            data_dir,
            sweep_interval_ms: 1_000,
            webhooks: Vec::new(),
            webhook_max_failures: 5,
            webhook_timeout_ms: 10_000,
            log_level: "info".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Layer an optional config file and `CHANT__*` environment variables over the defaults.
    ///
    /// Nested keys use a double underscore, e.g. `CHANT__ENGINE__VOTE_POINTS=20`.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("CHANT").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB deliberation database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("deliberations")
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
}
