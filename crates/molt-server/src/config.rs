//! Server configuration.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults (`HOST` and `PORT` are honoured for the listen address)
//! 2. Optional TOML file passed with `--config`
//! 3. `MOLT_*` environment variables (e.g. `MOLT_DRAIN_TIMEOUT_SECS`)
//! 4. Command-line flags
//!
//! A spawned replacement receives the same arguments and environment as its
//! parent, so both processes resolve the same configuration.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "3000";
const DEFAULT_PID_FILE: &str = "molt.pid";
const DEFAULT_DRAIN_TIMEOUT_SECS: i64 = 30;

/// Molt - TCP service host with zero-downtime restarts
///
/// Send SIGHUP to hand the listening socket to a fresh process,
/// SIGTERM or SIGINT to drain and exit.
#[derive(Debug, Parser)]
#[command(name = "molt-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind (ignored when inheriting a socket from a parent process)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// File recording the pid of the process that owns the socket
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Seconds to wait for open connections on shutdown; 0 waits forever
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,

    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per line
    Json,
}

/// Shape of the file/env layers before validation.
#[derive(Debug, Deserialize)]
struct RawConfig {
    listen: String,
    pid_file: PathBuf,
    drain_timeout_secs: u64,
    log_format: String,
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub pid_file: PathBuf,
    /// `None` means wait for connections indefinitely.
    pub drain_timeout: Option<Duration>,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Resolve configuration from defaults, file, environment and `cli`.
    pub fn load(cli: &Cli) -> Result<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var("PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string());

        let mut builder = config::Config::builder()
            .set_default("listen", format!("{host}:{port}"))?
            .set_default("pid_file", DEFAULT_PID_FILE)?
            .set_default("drain_timeout_secs", DEFAULT_DRAIN_TIMEOUT_SECS)?
            .set_default("log_format", "pretty")?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }

        let raw: RawConfig = builder
            .add_source(config::Environment::with_prefix("MOLT").try_parsing(true))
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        Self::resolve(raw, cli)
    }

    fn resolve(mut raw: RawConfig, cli: &Cli) -> Result<Self> {
        if let Some(listen) = &cli.listen {
            raw.listen = listen.clone();
        }
        if let Some(pid_file) = &cli.pid_file {
            raw.pid_file = pid_file.clone();
        }
        if let Some(secs) = cli.drain_timeout_secs {
            raw.drain_timeout_secs = secs;
        }
        if cli.log_file.is_some() {
            raw.log_file = cli.log_file.clone();
        }

        let listen = raw
            .listen
            .to_socket_addrs()
            .with_context(|| format!("Invalid listen address {:?}", raw.listen))?
            .next()
            .ok_or_else(|| anyhow!("Listen address {:?} resolved to nothing", raw.listen))?;

        let log_format = match cli.log_format {
            Some(format) => format,
            None => LogFormat::from_str(&raw.log_format, true)
                .map_err(|e| anyhow!("Invalid log format {:?}: {e}", raw.log_format))?,
        };

        let drain_timeout =
            (raw.drain_timeout_secs > 0).then(|| Duration::from_secs(raw.drain_timeout_secs));

        Ok(Self {
            listen,
            pid_file: raw.pid_file,
            drain_timeout,
            log_format,
            log_file: raw.log_file,
        })
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!("Listen address: {}", self.listen);
        info!("Pid file: {}", self.pid_file.display());
        match self.drain_timeout {
            Some(timeout) => info!("Drain timeout: {}s", timeout.as_secs()),
            None => info!("Drain timeout: unbounded"),
        }
        if let Some(log_file) = &self.log_file {
            info!("Log file: {}", log_file.display());
        }
    }
}
