//! # molt-ecdysis
//!
//! Zero-downtime restarts for a single-listener TCP service, following the
//! [Cloudflare Ecdysis pattern](https://blog.cloudflare.com/ecdysis-rust-graceful-restarts/).
//!
//! ## Overview
//!
//! 1. On `SIGHUP` the serving process spawns a copy of itself, passing the
//!    listening socket at fd 3 and `MOLT_SPAWNED=1` in the environment
//! 2. The new process adopts the socket, records its pid, and sends
//!    `SIGTERM` to its parent
//! 3. The parent stops accepting and drains in-flight connections
//! 4. After drain (or timeout), the parent exits
//!
//! A spawn failure is logged and the current process keeps serving.
//!
//! ## Signal Conventions
//!
//! - `SIGHUP`: graceful restart (spawn replacement, keep serving until told to drain)
//! - `SIGTERM`, `SIGINT`: graceful shutdown (drain connections, then exit)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). Elsewhere, restarts have to be
//! delegated to an external supervisor that starts the new process only
//! after the old one has released the port.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

mod error;
mod handoff;
mod lifecycle;
mod listener;
mod pidfile;
mod restart;
mod role;
mod signals;
mod tracker;

pub use error::{InheritError, LifecycleError, ListenerError, PidFileError, SpawnError};
pub use handoff::{ChildHandle, Handoff, INHERITED_FD};
pub use lifecycle::{
    ConnectionHandler, DrainOutcome, Lifecycle, LifecycleConfig, LifecycleState,
    DEFAULT_DRAIN_TIMEOUT,
};
pub use listener::{GracefulListener, ListenerState, TrackedStream};
pub use pidfile::PidFile;
pub use restart::UnixHandoff;
pub use role::{ProcessRole, SPAWNED_ENV, SPAWNED_ENV_VALUE};
pub use signals::{LifecycleEvent, SignalCoordinator, Trigger};
pub use tracker::{ConnectionGuard, ConnectionTracker};
