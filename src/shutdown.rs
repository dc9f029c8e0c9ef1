//! Graceful shutdown for the control plane.
//!
//! Admission stops first; in-flight completion calls then get a bounded
//! window to reach a terminal message before the caller tears down.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

impl ShutdownState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: usize },
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Tracks in-flight completion calls and gates admission.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Admit one call. `None` once draining has begun.
    pub fn track(&self) -> Option<ShutdownGuard> {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if !self.is_accepting() {
            self.release();
            return None;
        }
        Some(ShutdownGuard { coordinator: self.clone() })
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    fn release(&self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.drained.notify_waiters();
        }
    }

    /// Stop admitting and wait up to `timeout` for in-flight calls.
    pub async fn initiate(&self, timeout: Duration) -> ShutdownResult {
        self.shared.state.store(1, Ordering::Release);
        tracing::info!(in_flight = self.in_flight_count(), "draining in-flight completions");

        let result = self.wait_for_drain(timeout).await;
        self.shared.state.store(2, Ordering::Release);
        match &result {
            ShutdownResult::Complete => tracing::info!("drain complete"),
            ShutdownResult::Timeout { remaining } => {
                tracing::warn!(remaining, "drain timed out");
            }
        }
        result
    }

    async fn wait_for_drain(&self, timeout: Duration) -> ShutdownResult {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let drained = self.shared.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            let count = self.in_flight_count();
            if count == 0 {
                return ShutdownResult::Complete;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return match self.in_flight_count() {
                    0 => ShutdownResult::Complete,
                    remaining => ShutdownResult::Timeout { remaining },
                };
            }
        }
    }
}

/// Held for the duration of one completion call.
pub struct ShutdownGuard {
    coordinator: ShutdownCoordinator,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.coordinator.release();
    }
}
