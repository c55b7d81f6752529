// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync reconciler daemon.
//!
//! Drains the Redis sync queues into the durable store until Ctrl-C.
//!
//! Usage:
//!   sync-reconciler --redis-url redis://127.0.0.1:6379 --document-url mongodb://127.0.0.1:27017
//!
//! Environment variables:
//!   RECONCILER_CONFIG - path to a JSON config file (all fields optional)
//!   REDIS_URL - buffer store URL, overrides the config file
//!   DOCUMENT_STORE_URL - durable store URL (mongodb://, sqlite:, mysql://)
//!   MONGODB_URI - fallback for DOCUMENT_STORE_URL
//!   MONGODB_DATABASE - Mongo database name
//!   RECONCILER_LOG_JSON - "1" or "true" for JSON log lines
//!   RUST_LOG - log filter (default: info)

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sync_reconciler::{ReconcilerConfig, ReconciliationService};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sync-reconciler")]
#[command(about = "Reconciles Redis write buffers into a durable document store")]
#[command(version)]
struct Args {
    /// JSON config file; every field is optional
    #[arg(long, env = "RECONCILER_CONFIG")]
    config: Option<PathBuf>,

    /// Buffer store URL
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Durable store URL (mongodb://, sqlite:, mysql://)
    #[arg(long, env = "DOCUMENT_STORE_URL")]
    document_url: Option<String>,

    /// Older name for the durable store URL
    #[arg(long, env = "MONGODB_URI", hide = true)]
    mongodb_uri: Option<String>,

    /// Mongo database name
    #[arg(long, env = "MONGODB_DATABASE")]
    database: Option<String>,

    /// Emit JSON log lines
    #[arg(long, env = "RECONCILER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the config file, then apply the command line on top.
    fn into_config(self) -> Result<ReconcilerConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
                ReconcilerConfig::from_json(&raw)
                    .map_err(|e| format!("invalid config {}: {}", path.display(), e))?
            }
            None => ReconcilerConfig::default(),
        };

        if let Some(url) = self.redis_url {
            config.redis_url = Some(url);
        }
        if let Some(url) = self.document_url.or(self.mongodb_uri) {
            config.document_url = Some(url);
        }
        if let Some(database) = self.database {
            config.document_database = database;
        }
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sync_reconciler=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let service = match ReconciliationService::connect(config).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Failed to connect stores");
            return ExitCode::FAILURE;
        }
    };

    service.start().await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");

    service.stop().await;
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("sync-reconciler").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_args_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"redis_url": "redis://file:6379", "worker_count": 4}}"#).unwrap();
        let path = file.path().to_str().unwrap();

        let config = parse(&[
            "--config",
            path,
            "--redis-url",
            "redis://cli:6379",
            "--document-url",
            "sqlite::memory:",
            "--database",
            "audit",
        ])
        .into_config()
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cli:6379"));
        assert_eq!(config.document_url.as_deref(), Some("sqlite::memory:"));
        assert_eq!(config.document_database, "audit");
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn test_mongodb_uri_is_fallback() {
        let args = Args {
            config: None,
            redis_url: None,
            document_url: None,
            mongodb_uri: Some("mongodb://legacy:27017".to_string()),
            database: None,
            log_json: false,
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.document_url.as_deref(), Some("mongodb://legacy:27017"));
        assert_eq!(config.document_database, "rmi");
    }

    #[test]
    fn test_missing_config_file_is_error() {
        let args = parse(&["--config", "/nonexistent/reconciler.json"]);
        assert!(args.into_config().unwrap_err().contains("failed to read"));
    }
}
