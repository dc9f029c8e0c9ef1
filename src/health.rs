//! Health reporting for the control plane.
//!
//! Liveness is unconditional; readiness and the overall state derive from a
//! dispatcher snapshot and the shutdown state.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::scheduler::DispatcherSnapshot;
use crate::shutdown::ShutdownState;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    /// Serving, but new work will queue or be rejected.
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub ready: bool,
    pub accepting_requests: bool,
    pub runners: usize,
    pub free_memory: u64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Report `Degraded` while no runner is registered.
    pub require_runner: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { require_runner: true }
    }
}

pub struct HealthChecker {
    config: HealthConfig,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(config: HealthConfig) -> Self {
        Self { config, start_time: Instant::now() }
    }

    /// Check liveness: process is responsive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Accepting callers and able to queue at least one more request.
    pub fn is_ready(&self, shutdown_state: ShutdownState, snapshot: &DispatcherSnapshot) -> bool {
        shutdown_state == ShutdownState::Running && snapshot.queue_depth < snapshot.queue_capacity
    }

    pub fn report(&self, shutdown_state: ShutdownState, snapshot: &DispatcherSnapshot) -> HealthReport {
        let free_memory = snapshot
            .runners
            .iter()
            .map(|r| r.total_memory.saturating_sub(r.allocated_memory))
            .sum();
        HealthReport {
            state: self.compute_state(shutdown_state, snapshot),
            ready: self.is_ready(shutdown_state, snapshot),
            accepting_requests: shutdown_state == ShutdownState::Running,
            runners: snapshot.runners.len(),
            free_memory,
            queue_depth: snapshot.queue_depth,
            queue_capacity: snapshot.queue_capacity,
            in_flight: snapshot.in_flight,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn compute_state(&self, shutdown_state: ShutdownState, snapshot: &DispatcherSnapshot) -> HealthState {
        if shutdown_state != ShutdownState::Running {
            return HealthState::Unhealthy;
        }
        if self.config.require_runner && snapshot.runners.is_empty() {
            return HealthState::Degraded;
        }
        if snapshot.queue_depth >= snapshot.queue_capacity {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
