//! Error types for the dispatch control plane.
//!
//! Every failure is scoped to one request or one runner. Nothing here is
//! escalated to the process.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced to callers and runner-facing handlers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("No runner available and pending queue is full ({capacity} requests)")]
    QueueFull { capacity: usize },

    #[error("Runner {runner_id} stopped heartbeating while serving the request")]
    RunnerLost { runner_id: String },

    #[error("Runner error: {0}")]
    Runner(String),

    #[error("No terminal response within {0:?}")]
    Timeout(Duration),

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Control plane is shutting down")]
    ShuttingDown,

    #[error("Unknown runner: {0}")]
    UnknownRunner(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// Returns true if the caller may resubmit the same work under a new
    /// request identity.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::RunnerLost { .. } | Self::Timeout(_) | Self::Transport(_)
                | Self::ShuttingDown
        )
    }

    /// Returns true if this error should be logged as a warning rather
    /// than an error.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::QueueFull { .. } | Self::Cancelled | Self::ShuttingDown)
    }

    /// Short label used for the failure metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull { .. } => "queue_full",
            Self::RunnerLost { .. } => "runner_lost",
            Self::Runner(_) => "runner_error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::ShuttingDown => "shutting_down",
            Self::UnknownRunner(_) => "unknown_runner",
            Self::UnknownRequest(_) => "unknown_request",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Transport(_) => "transport",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_and_runner_loss_are_retriable() {
        assert!(DispatchError::QueueFull { capacity: 4 }.is_retriable());
        assert!(DispatchError::RunnerLost { runner_id: "r1".into() }.is_retriable());
        assert!(DispatchError::Timeout(Duration::from_secs(1)).is_retriable());
    }

    #[test]
    fn runner_reported_errors_are_not_retriable() {
        let err = DispatchError::Runner("too many tokens".into());
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("too many tokens"));
        assert!(!DispatchError::Cancelled.is_retriable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(DispatchError::Runner("x".into()).kind(), "runner_error");
        assert_eq!(DispatchError::RunnerLost { runner_id: "r1".into() }.kind(), "runner_lost");
        assert_eq!(DispatchError::from(TransportError::Closed).kind(), "transport");
    }
}
