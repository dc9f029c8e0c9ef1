//! Scheduler metrics through the `metrics` facade.
//!
//! The library only emits; installing an exporter is left to the binary
//! embedding the control plane.

use ::metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions. Safe to call more than once.
pub fn init_metrics() {
    describe_counter!("dispatch_decisions_total", "Placement decisions by outcome");
    describe_counter!("dispatch_requests_finished_total", "Requests reaching a terminal status");
    describe_counter!("dispatch_request_failures_total", "Failed requests by error kind");
    describe_counter!("dispatch_runner_evictions_total", "Runners evicted after missing heartbeats");
    describe_counter!("dispatch_envelope_errors_total", "Undecodable or misrouted response envelopes");
    describe_gauge!("dispatch_queue_depth", "Requests waiting in the pending queue");
    describe_gauge!("dispatch_runners", "Live runners in the registry");
    describe_histogram!("dispatch_completion_seconds", "Time from submission to terminal response");
}

pub fn record_decision(outcome: &'static str) {
    counter!("dispatch_decisions_total", "outcome" => outcome).increment(1);
}

pub fn record_finished(status: &'static str) {
    counter!("dispatch_requests_finished_total", "status" => status).increment(1);
}

pub fn record_failure(kind: &'static str) {
    counter!("dispatch_request_failures_total", "kind" => kind).increment(1);
}

pub fn record_eviction(count: usize) {
    counter!("dispatch_runner_evictions_total").increment(count as u64);
}

pub fn record_envelope_error(kind: &'static str) {
    counter!("dispatch_envelope_errors_total", "kind" => kind).increment(1);
}

pub fn record_queue_depth(depth: usize) {
    gauge!("dispatch_queue_depth").set(depth as f64);
}

pub fn record_runner_count(count: usize) {
    gauge!("dispatch_runners").set(count as f64);
}

pub fn record_completion_latency(seconds: f64, streaming: bool) {
    let mode = if streaming { "stream" } else { "unary" };
    histogram!("dispatch_completion_seconds", "mode" => mode).record(seconds);
}
