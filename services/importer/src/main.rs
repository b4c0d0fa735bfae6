// importer: Copies Kubernetes events from a Redis stream into PostgreSQL.
//
// Loads config, sets up tracing, starts the importer and waits for Ctrl-C or
// SIGTERM before shutting it down.

use clap::Parser;
use importer::config::{self, ImporterConfig};
use importer::supervisor;
use k8see_log::{ActivityLog, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Upper bound on the whole shutdown sequence before the process exits anyway.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(
    name = "importer",
    version,
    about = "Import Kubernetes events from a Redis stream into PostgreSQL"
)]
struct Cli {
    /// YAML or TOML config file; environment variables are used when omitted.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<ImporterConfig, config::ConfigError> {
    match &cli.config {
        Some(path) => config::load_config_from_path(path),
        None => {
            eprintln!("no config file specified, reading configuration from the environment");
            config::load_config_from_env()
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.tracing_directive())),
        )
        .init();

    let log = Arc::new(ActivityLog::new());
    let handle = match supervisor::start(&cfg, log.clone()).await {
        Ok(h) => h,
        Err(e) => {
            error!("failed to start importer: {}", e);
            eprintln!("FATAL: failed to start importer: {}", e);
            std::process::exit(1);
        }
    };

    wait_for_signal(&log).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.shutdown())
        .await
        .is_err()
    {
        warn!("shutdown timeout exceeded, forcing exit");
        std::process::exit(1);
    }
    info!("importer shutdown complete");
}

async fn wait_for_signal(log: &ActivityLog) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                log.log_at(
                    LogLevel::Error,
                    format!("failed to install SIGTERM handler: {e}"),
                );
                tokio::signal::ctrl_c().await.ok();
                log.log("shutdown: Ctrl-C received");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => log.log("shutdown: SIGINT received"),
            _ = sigterm.recv() => log.log("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log.log("shutdown: Ctrl-C received");
    }
}
