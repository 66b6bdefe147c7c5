//! Chant node binary.
//!
//! Opens the RocksDB deliberation store, wires webhook delivery and runs the
//! timeout scheduler until interrupted.

use std::path::PathBuf;
use std::process;

use chant_node_lib::{Node, NodeConfig, WebhookSubscriber};
use clap::Parser;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "chant-node",
    version,
    about = "Chant deliberation node: RocksDB storage, timeout scheduler and webhooks"
)]
struct Args {
    /// TOML config file, layered under CHANT__* environment variables
    #[arg(long, env = "CHANT_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the deliberation database
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Milliseconds between timeout sweeps
    #[arg(long)]
    sweep_interval_ms: Option<u64>,

    /// Webhook subscriber as URL=SECRET (repeatable)
    #[arg(long = "webhook", value_parser = parse_webhook)]
    webhooks: Vec<WebhookSubscriber>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,
}

fn parse_webhook(raw: &str) -> Result<WebhookSubscriber, String> {
    let (url, secret) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected URL=SECRET, got {raw:?}"))?;
    if url.is_empty() || secret.is_empty() {
        return Err("webhook URL and secret must both be non-empty".into());
    }
    Ok(WebhookSubscriber {
        url: url.to_string(),
        secret: secret.to_string(),
    })
}

impl Args {
    /// Apply command-line overrides on top of the layered config.
    fn into_config(self, mut config: NodeConfig) -> (NodeConfig, String) {
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(ms) = self.sweep_interval_ms {
            config.sweep_interval_ms = ms;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        config.webhooks.extend(self.webhooks);
        (config, self.log_format)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let base = match NodeConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            process::exit(1);
        }
    };
    let (config, log_format) = args.into_config(base);

    init_logging(&config.log_level, &log_format);

    info!("Chant Node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);
    info!("sweep_interval: {:?}", config.sweep_interval());
    info!("webhooks: {}", config.webhooks.len());

    let node = match Node::new(config).await {
        Ok(n) => n,
        Err(e) => {
            error!("failed to start node: {}", e);
            process::exit(1);
        }
    };

    info!("Chant node running (Ctrl+C to stop)");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down...");
    };

    tokio::select! {
        _ = node.run() => {
            warn!("scheduler loop exited");
        }
        _ = shutdown_signal => {
            info!("shutdown signal received");
        }
    }

    if let Err(e) = node.shutdown() {
        error!("shutdown failed: {}", e);
        process::exit(1);
    }
    info!("Chant node shutdown complete");
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_flag_splits_on_last_equals() {
        let hook = parse_webhook("http://127.0.0.1:9000/hook?a=b=s3cret").unwrap();
        assert_eq!(hook.url, "http://127.0.0.1:9000/hook?a=b");
        assert_eq!(hook.secret, "s3cret");
        assert!(parse_webhook("http://no-secret").is_err());
        assert!(parse_webhook("http://x=").is_err());
    }

    #[test]
    fn cli_overrides_layered_config() {
        let args = Args::parse_from([
            "chant-node",
            "--data-dir",
            "/tmp/chant-cli",
            "--sweep-interval-ms",
            "250",
            "--webhook",
            "http://localhost/h=k",
        ]);
        let (config, format) = args.into_config(NodeConfig::default());
        assert_eq!(config.data_dir, PathBuf::from("/tmp/chant-cli"));
        assert_eq!(config.sweep_interval_ms, 250);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.webhooks.len(), 1);
        assert_eq!(format, "text");
    }
}
