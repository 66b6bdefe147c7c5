use thiserror::Error;

use chant_core::error::{ChantError, StoreError};

/// Failures while composing or running a node.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Engine(#[from] ChantError),
    #[error("config: {0}")] Config(#[from] config::ConfigError),
    #[error("http client: {0}")] Http(#[from] reqwest::Error),
    #[error("io: {0}")] Io(#[from] std::io::Error),
    #[error("scheduler task: {0}")] Task(#[from] tokio::task::JoinError),
}
