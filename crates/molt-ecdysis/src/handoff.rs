//! Platform seam for socket handoff between processes.

use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::process::ExitStatus;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{InheritError, SpawnError};

/// Descriptor slot the listening socket occupies in a spawned process:
/// the first one after stdin, stdout and stderr.
pub const INHERITED_FD: RawFd = 3;

/// OS operations the lifecycle needs to hand a listening socket to a
/// replacement process.
///
/// [`UnixHandoff`](crate::UnixHandoff) is the real implementation; tests
/// substitute their own.
pub trait Handoff: Send + Sync + 'static {
    /// Reconstruct the listening socket passed down by the parent.
    fn inherit_listener(&self) -> Result<std::net::TcpListener, InheritError>;

    /// Launch a replacement process that inherits `listener_fd`.
    ///
    /// Must not wait for the child to become ready.
    fn spawn_child(&self, listener_fd: RawFd) -> Result<ChildHandle, SpawnError>;

    /// Tell the parent that this process now owns the socket, prompting it
    /// to drain.
    fn notify_parent(&self, parent_pid: u32) -> io::Result<()>;
}

/// A spawned replacement process.
pub struct ChildHandle {
    pid: u32,
    exit: BoxFuture<'static, io::Result<ExitStatus>>,
}

impl ChildHandle {
    /// `exit` resolves when the child terminates.
    pub fn new<F>(pid: u32, exit: F) -> Self
    where
        F: Future<Output = io::Result<ExitStatus>> + Send + 'static,
    {
        Self {
            pid,
            exit: exit.boxed(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for the child to exit.
    pub async fn wait(self) -> io::Result<ExitStatus> {
        self.exit.await
    }
}

impl fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildHandle")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
