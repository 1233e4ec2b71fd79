//! Accept-side wrapper around the listening socket.
//!
//! [`GracefulListener`] registers every accepted connection with the
//! [`ConnectionTracker`] and supports a cooperative stop that can be issued
//! from any task while another task is parked in `accept()`.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ListenerError;
use crate::tracker::{ConnectionGuard, ConnectionTracker};

const ACTIVE: u8 = 0;
const STOPPING: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle of a [`GracefulListener`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Active,
    Stopping,
    Stopped,
}

/// A listening socket that tracks its connections and can be stopped once.
#[derive(Debug)]
pub struct GracefulListener {
    /// `None` once stopped. In-flight accepts hold their own clone, so the
    /// descriptor closes when the last of them observes the stop token.
    socket: Mutex<Option<Arc<TcpListener>>>,
    state: AtomicU8,
    stop: CancellationToken,
    tracker: ConnectionTracker,
}

impl GracefulListener {
    pub fn new(listener: TcpListener, tracker: ConnectionTracker) -> Self {
        Self {
            socket: Mutex::new(Some(Arc::new(listener))),
            state: AtomicU8::new(ACTIVE),
            stop: CancellationToken::new(),
            tracker,
        }
    }

    /// Wait for the next connection.
    ///
    /// The returned stream is registered with the tracker until it is
    /// dropped. Returns [`ListenerError::Stopped`] once [`stop`](Self::stop)
    /// has been called.
    pub async fn accept(&self) -> Result<TrackedStream, ListenerError> {
        let socket = self.socket_handle().ok_or(ListenerError::Stopped)?;

        tokio::select! {
            biased;
            () = self.stop.cancelled() => Err(ListenerError::Stopped),
            accepted = socket.accept() => {
                let (stream, peer) = accepted?;
                Ok(TrackedStream {
                    stream,
                    peer,
                    guard: self.tracker.add(),
                })
            }
        }
    }

    /// Stop accepting and release the socket.
    ///
    /// Never blocks. A second call returns [`ListenerError::AlreadyStopped`].
    /// Connections already accepted are unaffected.
    pub fn stop(&self) -> Result<(), ListenerError> {
        self.state
            .compare_exchange(ACTIVE, STOPPING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| ListenerError::AlreadyStopped)?;

        self.stop.cancel();
        let socket = self.lock_socket().take();
        let addr = socket.as_ref().and_then(|s| s.local_addr().ok());
        drop(socket);

        self.state.store(STOPPED, Ordering::SeqCst);
        info!(addr = ?addr, "Listener stopped, refusing new connections");
        Ok(())
    }

    pub fn state(&self) -> ListenerState {
        match self.state.load(Ordering::SeqCst) {
            ACTIVE => ListenerState::Active,
            STOPPING => ListenerState::Stopping,
            _ => ListenerState::Stopped,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() != ListenerState::Active
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self.socket_handle() {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is stopped",
            )),
        }
    }

    /// Raw descriptor of the underlying socket, `None` once stopped.
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.lock_socket().as_ref().map(|s| s.as_raw_fd())
    }

    /// Shared handle to the socket. Holding it keeps the descriptor open
    /// even if the listener is stopped concurrently.
    pub(crate) fn socket_handle(&self) -> Option<Arc<TcpListener>> {
        self.lock_socket().clone()
    }

    fn lock_socket(&self) -> MutexGuard<'_, Option<Arc<TcpListener>>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An accepted connection, registered with the tracker while it lives.
#[derive(Debug)]
pub struct TrackedStream {
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
}

impl TrackedStream {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    /// Split into the stream and its registration. The connection stays
    /// counted until the guard drops.
    pub fn into_parts(self) -> (TcpStream, ConnectionGuard) {
        (self.stream, self.guard)
    }
}
