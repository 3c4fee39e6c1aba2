//! Graceful shutdown controller.
//!
//! A watch channel broadcasts the drain signal to every long-lived task
//! (listener, readers, dispatcher, writer, both engine workers); an
//! atomic counter with RAII guards tracks requests still inside the
//! dispatcher so shutdown can wait for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Server lifecycle: Running -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Accepting connections and serving requests.
    Running,
    /// Drain signalled: no new connections, queues being emptied.
    Draining,
    /// All in-flight requests finished.
    Stopped,
}

/// Coordinates shutdown across the pipeline's tasks.
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    state: ArcSwap<LifecycleState>,
    in_flight: Arc<AtomicU64>,
}

impl ShutdownController {
    /// Creates a controller in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: tx,
            state: ArcSwap::from_pointee(LifecycleState::Running),
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A receiver that resolves once drain is signalled. Long-lived
    /// tasks select on this alongside their main loop.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Signal drain: transition to `Draining` and wake every subscriber.
    pub fn begin_drain(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        // send_replace updates the value even with no receivers (they may
        // already be gone during teardown), unlike send which no-ops then.
        self.signal.send_replace(true);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Whether drain has been signalled.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        *self.signal.borrow()
    }

    /// RAII guard counting one in-flight request. The counter drops with
    /// the guard even if the dispatcher panics mid-request.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Requests currently inside the dispatcher.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait until every in-flight request finishes, up to `timeout`.
    /// Transitions to `Stopped` and returns true on success; leaves the
    /// state at `Draining` and returns false on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(LifecycleState::Stopped));
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
