//! Molt Server - TCP service host with zero-downtime restarts.
//!
//! `SIGHUP` spawns a replacement that inherits the listening socket;
//! `SIGTERM`/`SIGINT` stop accepting and drain open connections before exit.

use anyhow::{Context, Result};
use clap::Parser;
use molt_ecdysis::{DrainOutcome, Lifecycle, LifecycleConfig};
use tracing::{error, info, warn};

mod config;
mod handler;
mod telemetry;

use config::{Cli, ServerConfig};
use handler::StatusHandler;

#[tokio::main]
async fn main() -> Result<()> {
    // Before anything slow: a spawned process signals this pid once it serves.
    let parent_pid = std::os::unix::process::parent_id();
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli)?;

    telemetry::init(config.log_format, config.log_file.as_deref())?;

    info!("Molt Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let lifecycle = Lifecycle::new(
        LifecycleConfig {
            listen_addr: config.listen,
            pid_file: Some(config.pid_file.clone()),
            drain_timeout: config.drain_timeout,
            handle_signals: true,
        },
        StatusHandler::new(),
    )
    .with_parent_pid(parent_pid);
    info!(role = %lifecycle.role(), pid = std::process::id(), "Process role detected");

    let outcome = lifecycle
        .run()
        .await
        .inspect_err(|e| error!(error = %e, "Server failed"))
        .context("Server failed")?;

    match outcome {
        DrainOutcome::Clean => info!("Shutdown complete"),
        DrainOutcome::Forced { remaining } => warn!(
            remaining_connections = remaining,
            "Shutdown complete, connections were closed by the drain timeout"
        ),
    }

    Ok(())
}
