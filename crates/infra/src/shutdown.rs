//! Graceful shutdown: in-flight accounting and the stop signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{info, warn};

#[derive(Debug)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
    shutdown: watch::Sender<bool>,
}

/// Shared by the consumer path, the retry scheduler and the process entry
/// point. Cloning is cheap; all clones see the same counter and signal.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    TimedOut { remaining: usize },
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                shutdown,
            }),
        }
    }

    /// Count one delivery as in flight until the guard is dropped.
    pub fn track(&self) -> InFlightGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub fn signal_shutdown(&self) {
        if !self.inner.shutdown.send_replace(true) {
            info!(in_flight = self.in_flight(), "shutdown signalled");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Resolves once shutdown has been signalled.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns Ok.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Wait for in-flight work to finish, at most `timeout`.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        let wait_idle = async {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait_idle).await {
            Ok(()) => {
                info!("in-flight deliveries drained");
                DrainOutcome::Drained
            }
            Err(_) => {
                let remaining = self.in_flight();
                warn!(
                    remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown drain timed out; exiting with deliveries in flight"
                );
                DrainOutcome::TimedOut { remaining }
            }
        }
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
