//! Process lifecycle: acquire the socket, serve, restart on request, drain on exit.
//!
//! ```text
//! Starting ──► Serving ──(SIGTERM/SIGINT)──► Draining ──► Stopped
//!                 │ ▲
//!          SIGHUP │ │ replacement spawned (or died before taking over)
//!                 └─┘
//! ```
//!
//! A spawned replacement writes the pid file and then sends SIGTERM to its
//! parent. The parent only removes the pid file if it still names itself, so
//! the replacement's entry survives the parent's cleanup.

use std::future::Future;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{InheritError, LifecycleError, ListenerError, SpawnError};
use crate::handoff::Handoff;
use crate::listener::GracefulListener;
use crate::pidfile::PidFile;
use crate::restart::UnixHandoff;
use crate::role::ProcessRole;
use crate::signals::{Event, LifecycleEvent, SignalCoordinator, Trigger};
use crate::tracker::ConnectionTracker;

/// Drain timeout used when none is configured.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Application callbacks. The lifecycle never looks inside a connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve one accepted connection. Called once per connection on its own task.
    ///
    /// `draining` is cancelled when the process stops accepting. Handlers
    /// should finish the request in progress and close idle connections
    /// instead of waiting for the peer; anything still open when the drain
    /// timeout expires is closed for them.
    fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        draining: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// A restart was requested; called before the replacement is spawned.
    fn on_reload(&self) {}

    /// Called exactly once, after connections drained and before exit.
    fn on_shutdown(&self) {}
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Address to bind when running as the primary process.
    pub listen_addr: SocketAddr,
    pub pid_file: Option<PathBuf>,
    /// `None` waits for connections indefinitely.
    pub drain_timeout: Option<Duration>,
    /// Install SIGHUP/SIGTERM/SIGINT handlers. Disable when driving the
    /// lifecycle only through a [`Trigger`].
    pub handle_signals: bool,
}

impl LifecycleConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            pid_file: None,
            drain_timeout: Some(DEFAULT_DRAIN_TIMEOUT),
            handle_signals: true,
        }
    }
}

/// Observable lifecycle state, published through [`Lifecycle::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving {
        local_addr: SocketAddr,
        /// Pid of a spawned replacement that has not taken over yet.
        replacement: Option<u32>,
    },
    Draining,
    Stopped,
}

/// How the drain phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection finished on its own.
    Clean,
    /// The drain timeout expired and `remaining` connections were closed.
    Forced { remaining: usize },
}

impl DrainOutcome {
    pub fn is_clean(self) -> bool {
        matches!(self, DrainOutcome::Clean)
    }
}

/// Owns the listener, tracker and pid file of one serving process.
pub struct Lifecycle<H, P = UnixHandoff> {
    config: LifecycleConfig,
    handler: Arc<H>,
    handoff: P,
    role: ProcessRole,
    parent_pid: u32,
    tracker: ConnectionTracker,
    state: watch::Sender<LifecycleState>,
    trigger: Trigger,
    events: mpsc::UnboundedReceiver<Event>,
}

impl<H: ConnectionHandler> Lifecycle<H> {
    /// Lifecycle using Unix fd passing, with the role read from the environment.
    ///
    /// The parent pid is captured here, so construct the lifecycle early in
    /// `main`: a parent that exits before `run` must not be confused with
    /// whatever process adopted us.
    pub fn new(config: LifecycleConfig, handler: H) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::Starting);

        Self {
            config,
            handler: Arc::new(handler),
            handoff: UnixHandoff::default(),
            role: ProcessRole::from_env(),
            parent_pid: std::os::unix::process::parent_id(),
            tracker: ConnectionTracker::new(),
            state,
            trigger: Trigger::new(tx),
            events,
        }
    }
}

impl<H: ConnectionHandler, P: Handoff> Lifecycle<H, P> {
    pub fn with_handoff<Q: Handoff>(self, handoff: Q) -> Lifecycle<H, Q> {
        Lifecycle {
            config: self.config,
            handler: self.handler,
            handoff,
            role: self.role,
            parent_pid: self.parent_pid,
            tracker: self.tracker,
            state: self.state,
            trigger: self.trigger,
            events: self.events,
        }
    }

    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }

    /// Override the process notified after a spawned start.
    pub fn with_parent_pid(mut self, parent_pid: u32) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Parent pid captured at construction.
    pub fn parent_pid(&self) -> u32 {
        self.parent_pid
    }

    /// Handle for requesting restart or termination without OS signals.
    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Run until terminated.
    ///
    /// Only socket acquisition and signal installation fail the run; spawn
    /// and pid file problems are logged and serving continues.
    pub async fn run(self) -> Result<DrainOutcome, LifecycleError> {
        let Lifecycle {
            config,
            handler,
            handoff,
            role,
            parent_pid,
            tracker,
            state,
            trigger,
            mut events,
        } = self;

        let pid = std::process::id();
        info!(pid, parent_pid, role = %role, "Starting");

        let socket = acquire_socket(role, &config, &handoff).await?;
        let local_addr = socket.local_addr().unwrap_or(config.listen_addr);
        let listener = Arc::new(GracefulListener::new(socket, tracker.clone()));

        let signals = if config.handle_signals {
            let coordinator = SignalCoordinator::install().map_err(LifecycleError::Signals)?;
            Some(coordinator.forward(trigger.clone()))
        } else {
            None
        };

        let pid_file = config.pid_file.as_ref().map(PidFile::new);
        if let Some(pid_file) = &pid_file {
            match pid_file.write(pid) {
                Ok(()) => debug!(path = %pid_file.path().display(), pid, "Wrote pid file"),
                Err(e) => warn!(error = %e, "Could not write pid file, continuing without it"),
            }
        }

        if role.is_spawned() {
            match handoff.notify_parent(parent_pid) {
                Ok(()) => info!(parent_pid, "Took over listening socket, parent asked to drain"),
                Err(e) => warn!(parent_pid, error = %e, "Could not signal parent process"),
            }
        }

        let draining = CancellationToken::new();
        let force_close = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&listener),
            Arc::clone(&handler),
            draining.clone(),
            force_close.clone(),
        ));

        state.send_replace(LifecycleState::Serving {
            local_addr,
            replacement: None,
        });
        info!(addr = %local_addr, pid, "Serving");

        let mut replacement: Option<u32> = None;
        while let Some(event) = events.recv().await {
            match event {
                Event::Requested(LifecycleEvent::Restart) => {
                    if let Some(child_pid) = replacement {
                        warn!(child_pid, "Restart already in progress, ignoring request");
                        continue;
                    }

                    handler.on_reload();
                    match spawn_replacement(&handoff, &listener, &trigger) {
                        Ok(child_pid) => replacement = Some(child_pid),
                        Err(e) => error!(
                            error = %e,
                            "Failed to spawn replacement process, continuing to serve"
                        ),
                    }
                }
                Event::Requested(LifecycleEvent::Terminate) => break,
                Event::ChildExited {
                    pid: child_pid,
                    status,
                } => {
                    if replacement == Some(child_pid) {
                        replacement = None;
                        error!(
                            child_pid,
                            status = ?status,
                            "Replacement process exited before taking over"
                        );
                    } else {
                        debug!(child_pid, status = ?status, "Former replacement process exited");
                    }
                }
            }

            state.send_if_modified(|current| {
                let next = LifecycleState::Serving {
                    local_addr,
                    replacement,
                };
                let changed = *current != next;
                *current = next;
                changed
            });
        }

        if let Err(e) = listener.stop() {
            warn!(error = %e, "Listener was already stopped");
        }
        if let Err(e) = accept_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        draining.cancel();
        state.send_replace(LifecycleState::Draining);

        let outcome = drain(&tracker, config.drain_timeout, &force_close).await;
        handler.on_shutdown();

        if let Some(pid_file) = &pid_file {
            match pid_file.remove_if_owned(pid) {
                Ok(true) => debug!(path = %pid_file.path().display(), "Removed pid file"),
                Ok(false) => info!(
                    path = %pid_file.path().display(),
                    "Pid file names another process, leaving it in place"
                ),
                Err(e) => warn!(error = %e, "Could not clean up pid file"),
            }
        }

        if let Some(signals) = signals {
            signals.abort();
        }
        state.send_replace(LifecycleState::Stopped);
        info!(outcome = ?outcome, "Stopped");

        Ok(outcome)
    }
}

async fn acquire_socket<P: Handoff>(
    role: ProcessRole,
    config: &LifecycleConfig,
    handoff: &P,
) -> Result<TcpListener, LifecycleError> {
    match role {
        ProcessRole::Primary => {
            let socket = TcpListener::bind(config.listen_addr)
                .await
                .map_err(|source| LifecycleError::Bind {
                    addr: config.listen_addr,
                    source,
                })?;
            info!(addr = %config.listen_addr, "Bound listener");
            Ok(socket)
        }
        ProcessRole::Spawned => {
            let inherited = handoff.inherit_listener()?;
            inherited.set_nonblocking(true).map_err(InheritError::Io)?;
            let socket = TcpListener::from_std(inherited).map_err(InheritError::Io)?;
            Ok(socket)
        }
    }
}

/// Spawn a child that inherits the socket and watch for it exiting early.
fn spawn_replacement<P: Handoff>(
    handoff: &P,
    listener: &GracefulListener,
    trigger: &Trigger,
) -> Result<u32, SpawnError> {
    // Holding the handle keeps the descriptor open across the spawn even if
    // the listener is stopped concurrently.
    let socket = listener.socket_handle().ok_or(SpawnError::ListenerClosed)?;
    let child = handoff.spawn_child(socket.as_raw_fd())?;
    let child_pid = child.pid();

    let trigger = trigger.clone();
    tokio::spawn(async move {
        let status = child.wait().await.ok();
        trigger.child_exited(child_pid, status);
    });

    Ok(child_pid)
}

async fn accept_loop<H: ConnectionHandler>(
    listener: Arc<GracefulListener>,
    handler: Arc<H>,
    draining: CancellationToken,
    force_close: CancellationToken,
) {
    loop {
        let conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(ListenerError::Stopped) => break,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };

        let handler = Arc::clone(&handler);
        let draining = draining.child_token();
        let force_close = force_close.clone();
        tokio::spawn(async move {
            let peer = conn.peer_addr();
            // The guard lives until this task ends, however it ends.
            let (stream, _guard) = conn.into_parts();
            debug!(%peer, "Accepted connection");

            tokio::select! {
                result = handler.handle(stream, peer, draining) => {
                    if let Err(e) = result {
                        debug!(%peer, error = %e, "Connection handler failed");
                    }
                }
                () = force_close.cancelled() => {
                    warn!(%peer, "Force-closing connection after drain timeout");
                }
            }
        });
    }

    debug!("Accept loop stopped");
}

async fn drain(
    tracker: &ConnectionTracker,
    timeout: Option<Duration>,
    force_close: &CancellationToken,
) -> DrainOutcome {
    let active = tracker.active();
    if active == 0 {
        info!("No active connections, drain complete");
        return DrainOutcome::Clean;
    }

    info!(
        active_connections = active,
        timeout = ?timeout,
        "Draining active connections"
    );

    let Some(timeout) = timeout else {
        tracker.wait().await;
        info!("All connections drained cleanly");
        return DrainOutcome::Clean;
    };

    if tracker.wait_timeout(timeout).await {
        info!("All connections drained cleanly");
        return DrainOutcome::Clean;
    }

    let remaining = tracker.active();
    warn!(
        remaining_connections = remaining,
        timeout_secs = timeout.as_secs(),
        "Drain timeout expired, force-closing connections"
    );
    force_close.cancel();
    tracker.wait().await;

    DrainOutcome::Forced { remaining }
}
