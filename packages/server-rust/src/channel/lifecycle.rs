//! Dispatcher lifecycle state with in-flight request tracking.
//!
//! Uses `ArcSwap` for lock-free state reads and compare-and-swap transitions,
//! a `watch` channel for notifications, and an atomic counter with RAII guards
//! for in-flight requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::info;

/// Channel dispatcher state.
///
/// State machine: Setup -> Running -> Stopping -> Stopped. Setup may also go
/// straight to Stopped when a dispatcher is closed without ever opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Accepting configuration; the accept loop is not running.
    Setup,
    /// Accepting channels and processing messages.
    Running,
    /// Draining: no new channels, live channels are closing.
    Stopping,
    /// Terminal.
    Stopped,
}

/// Owns the dispatcher state and counts requests in flight.
#[derive(Debug)]
pub struct LifecycleController {
    state: ArcSwap<DispatcherState>,
    signal: watch::Sender<DispatcherState>,
    in_flight: Arc<AtomicU64>,
}

impl LifecycleController {
    /// Starts in `Setup`.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(DispatcherState::Setup);
        Self {
            state: ArcSwap::from_pointee(DispatcherState::Setup),
            signal,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> DispatcherState {
        **self.state.load()
    }

    /// Move `from` to `to` atomically.
    ///
    /// # Errors
    ///
    /// Returns the actual state if it was not `from`.
    pub fn transition(
        &self,
        from: DispatcherState,
        to: DispatcherState,
    ) -> Result<(), DispatcherState> {
        let current = self.state.load_full();
        if *current != from {
            return Err(*current);
        }
        let previous = self.state.compare_and_swap(&current, Arc::new(to));
        if !Arc::ptr_eq(&*previous, &current) {
            return Err(**previous);
        }
        self.signal.send_replace(to);
        info!(from = ?from, to = ?to, "dispatcher state transition");
        Ok(())
    }

    /// Receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DispatcherState> {
        self.signal.subscribe()
    }

    /// Creates an RAII guard that tracks an in-flight request.
    ///
    /// The counter is decremented when the guard drops, even if the request
    /// panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
