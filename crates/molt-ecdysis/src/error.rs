//! Error types for the restart core.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by [`GracefulListener`](crate::GracefulListener).
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The listener was stopped; no further connections will be accepted.
    #[error("Listener stopped")]
    Stopped,

    /// `stop()` was called on a listener that is already stopping or stopped.
    #[error("Listener already stopped")]
    AlreadyStopped,

    /// The OS refused the accept call (e.g. descriptor exhaustion).
    #[error("Accept failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to reconstruct the listening socket handed over by the parent.
#[derive(Debug, Error)]
pub enum InheritError {
    /// Nothing is open at the inherited descriptor slot.
    #[error("No descriptor open at fd {fd}")]
    MissingDescriptor { fd: RawFd },

    /// The descriptor exists but is not a socket.
    #[error("Inherited fd {fd} is not a socket")]
    NotASocket { fd: RawFd },

    /// The descriptor is a socket but not in the listening state.
    #[error("Inherited fd {fd} is not a listening socket")]
    NotListening { fd: RawFd },

    #[error("IO error on inherited socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to launch a replacement process. Never fatal to the serving process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The path of the running executable could not be determined.
    #[error("Cannot determine current executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    /// The listener was already closed, so there is no socket to hand over.
    #[error("Listener is closed, nothing to hand over")]
    ListenerClosed,

    /// Process creation failed.
    #[error("Failed to launch {}: {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pid file read/write failures. Logged, never fatal.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Pid file {} IO error: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Pid file {} has malformed contents {contents:?}", path.display())]
    Malformed { path: PathBuf, contents: String },
}

/// Fatal startup errors. Anything after startup is logged instead.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to inherit listening socket: {0}")]
    Inherit(#[from] InheritError),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}
