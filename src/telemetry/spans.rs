//! Span utilities for completion calls.

use tracing::{info_span, Span};

/// Extension trait for recording an outcome into a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for the standard completion span.
pub struct RequestSpan;

impl RequestSpan {
    /// `status`, `error.message` and `latency_ms` are filled in on completion.
    pub fn new(request_id: &str, owner_id: &str, model: &str, stream: bool) -> Span {
        info_span!(
            "completion",
            request_id = %request_id,
            owner_id = %owner_id,
            model = %model,
            stream,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
