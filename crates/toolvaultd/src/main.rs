//! toolvaultd - long-running manager process
//!
//! Opens the store, closes executions orphaned by a previous run, checks the
//! sandbox backend and flushes metrics on a fixed tick until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use toolvault_core::{DockerRuntime, ToolVault, VaultConfig, METRICS, VERSION};

#[derive(Parser)]
#[command(name = "toolvaultd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "toolvault manager daemon", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TOOLVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Seconds between metrics flushes
    #[arg(long, default_value = "60")]
    metrics_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    toolvault_core::init_tracing(args.json, level);

    let config = VaultConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let vault = ToolVault::open(&config)
        .await
        .context("Failed to open the toolvault store")?;

    let closed = vault
        .reconcile()
        .await
        .context("Startup reconciliation failed")?;
    if closed > 0 {
        warn!(closed, "closed executions orphaned by a previous run");
    }

    if !DockerRuntime::new(config.runtime.clone()).is_available().await {
        warn!(
            docker_bin = %config.runtime.docker_bin,
            "sandbox backend not reachable; executions will fail as sandbox_unavailable"
        );
    }

    info!(
        version = VERSION,
        max_concurrent = config.engine.max_concurrent_executions,
        "toolvaultd started"
    );

    let mut tick = tokio::time::interval(Duration::from_secs(args.metrics_interval_secs.max(1)));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = tick.tick() => METRICS.flush(),
            _ = &mut shutdown => break,
        }
    }

    METRICS.flush();
    info!("toolvaultd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
