//! Telemetry for the dispatch control plane.
//!
//! Structured logging, request spans and scheduler metrics.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    init_metrics, record_completion_latency, record_decision, record_envelope_error,
    record_eviction, record_failure, record_finished, record_queue_depth, record_runner_count,
};
pub use spans::{RequestSpan, SpanExt};
