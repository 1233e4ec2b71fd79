//! OS signal subscription and the lifecycle event channel.
//!
//! - `SIGHUP` → restart (spawn a replacement, keep serving)
//! - `SIGTERM`, `SIGINT` → drain and exit
//!
//! Signals are translated into [`LifecycleEvent`]s and delivered over the
//! same channel a [`Trigger`] feeds, so tests and embedders can drive the
//! lifecycle without real signals.

use std::io;
use std::process::ExitStatus;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A requested lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Spawn a replacement process and keep serving.
    Restart,
    /// Stop accepting, drain connections, exit.
    Terminate,
}

/// Everything the lifecycle's event loop reacts to.
#[derive(Debug)]
pub(crate) enum Event {
    Requested(LifecycleEvent),
    ChildExited {
        pid: u32,
        status: Option<ExitStatus>,
    },
}

/// Handle for requesting lifecycle transitions programmatically.
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: mpsc::UnboundedSender<Event>,
}

impl Trigger {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Request a graceful restart. Returns `false` if the lifecycle has ended.
    pub fn restart(&self) -> bool {
        self.send(LifecycleEvent::Restart)
    }

    /// Request drain and exit. Returns `false` if the lifecycle has ended.
    pub fn terminate(&self) -> bool {
        self.send(LifecycleEvent::Terminate)
    }

    pub fn send(&self, event: LifecycleEvent) -> bool {
        self.tx.send(Event::Requested(event)).is_ok()
    }

    pub(crate) fn child_exited(&self, pid: u32, status: Option<ExitStatus>) -> bool {
        self.tx.send(Event::ChildExited { pid, status }).is_ok()
    }
}

/// Subscribes to SIGHUP, SIGTERM and SIGINT.
#[derive(Debug)]
pub struct SignalCoordinator {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl SignalCoordinator {
    /// Install the handlers. From here on these signals no longer use their
    /// default disposition for this process.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    /// Wait for the next signal and translate it.
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        tokio::select! {
            Some(()) = self.hangup.recv() => {
                info!("Received SIGHUP, initiating graceful restart");
                Some(LifecycleEvent::Restart)
            }
            Some(()) = self.terminate.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                Some(LifecycleEvent::Terminate)
            }
            Some(()) = self.interrupt.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                Some(LifecycleEvent::Terminate)
            }
            else => None,
        }
    }

    /// Forward signals to `trigger` until the lifecycle stops listening.
    pub fn forward(mut self, trigger: Trigger) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                if !trigger.send(event) {
                    break;
                }
            }
            debug!("Signal forwarding stopped");
        })
    }
}
