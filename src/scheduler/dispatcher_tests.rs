use super::*;
use crate::protocol::ChatCompletionRequest;
use crate::scheduler::decision::DecisionOutcome;

fn request(model: &str, memory: u64) -> InferenceRequest {
    InferenceRequest::new(
        "owner",
        ChatCompletionRequest { model: model.into(), ..Default::default() },
        memory,
    )
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig { pull_wait: Duration::ZERO, ..Default::default() })
}

fn submit(d: &Dispatcher, req: InferenceRequest) -> Submission {
    d.submit(req).unwrap()
}

#[test]
fn places_on_runner_with_capacity() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let sub = submit(&d, request("llama3", 10));
    assert_eq!(sub.placement, Placement::Runner("r1".into()));
    assert_eq!(d.status(sub.request_id), Some(RequestStatus::Assigned));
    assert_eq!(d.active_slots("r1"), Some(1));
    assert_eq!(d.assigned_runner(sub.request_id).as_deref(), Some("r1"));
}

#[test]
fn queues_when_no_runner_fits() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10));
    let first = submit(&d, request("m", 10));
    let second = submit(&d, request("m", 10));
    let third = submit(&d, request("m", 10));
    assert_eq!(first.placement, Placement::Runner("r1".into()));
    assert_eq!(second.placement, Placement::Queued { position: 0 });
    assert_eq!(third.placement, Placement::Queued { position: 1 });
    assert_eq!(d.queue_len(), 2);
}

#[test]
fn completion_places_queued_requests_in_fifo_order() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10));
    let first = submit(&d, request("m", 10));
    let second = submit(&d, request("m", 10));
    let third = submit(&d, request("m", 10));

    d.complete(first.request_id).unwrap();
    assert_eq!(d.status(first.request_id), None);
    assert_eq!(d.status(second.request_id), Some(RequestStatus::Assigned));
    assert_eq!(d.status(third.request_id), Some(RequestStatus::Queued));
    assert_eq!(d.active_slots("r1"), Some(1));
}

#[test]
fn queued_head_blocks_smaller_requests_behind_it() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let held = submit(&d, request("m", 50));
    let big = submit(&d, request("m", 80));
    assert_eq!(big.placement, Placement::Queued { position: 0 });
    // Would fit on its own, but the head of the queue has claimed r1.
    let small = submit(&d, request("m", 10));
    assert_eq!(small.placement, Placement::Queued { position: 1 });

    d.complete(held.request_id).unwrap();
    assert_eq!(d.status(big.request_id), Some(RequestStatus::Assigned));
    assert_eq!(d.status(small.request_id), Some(RequestStatus::Assigned));
    assert_eq!(d.queue_len(), 0);
}

#[test]
fn oversized_head_does_not_block_requests_that_fit() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10));
    let huge = submit(&d, request("m", 100));
    assert_eq!(huge.placement, Placement::Queued { position: 0 });

    let small = submit(&d, request("m", 1));
    assert_eq!(small.placement, Placement::Runner("r1".into()));
    assert_eq!(d.status(huge.request_id), Some(RequestStatus::Queued));

    // A runner large enough for the head picks it up when it registers.
    d.update_runner(RunnerReport::new("r2", 100));
    assert_eq!(d.assigned_runner(huge.request_id).as_deref(), Some("r2"));
}

#[test]
fn full_queue_rejects_with_backpressure() {
    let d = Dispatcher::new(DispatcherConfig {
        queue: PendingQueueConfig { capacity: 2 },
        ..Default::default()
    });
    submit(&d, request("m", 1));
    submit(&d, request("m", 1));
    let err = d.submit(request("m", 1)).unwrap_err();
    assert!(matches!(err, DispatchError::QueueFull { capacity: 2 }));
    assert!(err.is_retriable());
    assert_eq!(d.queue_len(), 2);

    let outcomes: Vec<_> = d.decisions().into_iter().map(|d| d.outcome).collect();
    assert_eq!(outcomes.last(), Some(&DecisionOutcome::Rejected));
}

#[test]
fn duplicate_request_id_is_invalid() {
    let d = dispatcher();
    let req = request("m", 1);
    submit(&d, req.clone());
    assert!(matches!(d.submit(req), Err(DispatchError::InvalidRequest(_))));
}

#[test]
fn runner_report_drains_queue() {
    let d = dispatcher();
    let sub = submit(&d, request("m", 10));
    assert_eq!(d.status(sub.request_id), Some(RequestStatus::Queued));
    d.update_runner(RunnerReport::new("r1", 10));
    assert_eq!(d.status(sub.request_id), Some(RequestStatus::Assigned));
}

#[tokio::test]
async fn pull_hands_out_each_request_once() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let sub = submit(&d, request("m", 10));

    let pulled = d.pull_next("r1", &RequestFilter::any()).await.unwrap();
    assert_eq!(pulled.map(|r| r.id), Some(sub.request_id));
    assert_eq!(d.status(sub.request_id), Some(RequestStatus::Dispatched));
    assert!(d.pull_next("r1", &RequestFilter::any()).await.unwrap().is_none());
}

#[tokio::test]
async fn pull_from_unknown_runner_fails() {
    let d = dispatcher();
    let err = d.pull_next("ghost", &RequestFilter::any()).await.unwrap_err();
    assert!(matches!(err, DispatchError::UnknownRunner(id) if id == "ghost"));
}

#[tokio::test]
async fn pull_filter_skips_non_matching_work() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let llama = submit(&d, request("llama3:8b", 10));
    let phi = submit(&d, request("phi3:mini", 10));

    let pulled = d.pull_next("r1", &RequestFilter::family("phi3")).await.unwrap();
    assert_eq!(pulled.map(|r| r.id), Some(phi.request_id));
    assert_eq!(d.status(llama.request_id), Some(RequestStatus::Assigned));

    let pulled = d.pull_next("r1", &RequestFilter::any()).await.unwrap();
    assert_eq!(pulled.map(|r| r.id), Some(llama.request_id));
}

#[tokio::test]
async fn long_poll_wakes_on_placement() {
    let d = Arc::new(dispatcher());
    d.update_runner(RunnerReport::new("r1", 100));

    let puller = {
        let d = Arc::clone(&d);
        tokio::spawn(async move {
            d.pull_next_within("r1", &RequestFilter::any(), Duration::from_secs(5)).await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let sub = submit(&d, request("m", 10));

    let pulled = tokio::time::timeout(Duration::from_secs(2), puller).await.unwrap().unwrap().unwrap();
    assert_eq!(pulled.map(|r| r.id), Some(sub.request_id));
}

#[test]
fn evicted_runner_fails_its_requests() {
    let d = dispatcher();
    let t0 = Instant::now();
    d.update_runner_at(RunnerReport::new("r1", 100), t0);
    let mut sub = submit(&d, request("m", 10));

    let report = d.sweep_at(t0 + Duration::from_secs(31));
    assert_eq!(report.evicted_runners, vec!["r1".to_string()]);
    assert_eq!(report.failed_requests, 1);
    assert_eq!(d.runner_count(), 0);
    assert_eq!(d.status(sub.request_id), None);
    assert!(matches!(
        sub.failure.try_take(),
        Some(DispatchError::RunnerLost { runner_id }) if runner_id == "r1"
    ));
}

#[test]
fn expired_slot_fails_with_timeout() {
    let d = Dispatcher::new(DispatcherConfig {
        slot_ttl: Duration::from_secs(1),
        ..Default::default()
    });
    let t0 = Instant::now();
    d.update_runner_at(RunnerReport::new("r1", 10), t0);
    let mut held = submit(&d, request("m", 10));
    let waiting = submit(&d, request("m", 10));

    let report = d.sweep_at(t0 + Duration::from_secs(2));
    assert_eq!(report.expired_slots, 1);
    assert_eq!(report.placed_from_queue, 1);
    assert!(matches!(held.failure.try_take(), Some(DispatchError::Timeout(_))));
    assert_eq!(d.status(waiting.request_id), Some(RequestStatus::Assigned));
}

#[tokio::test]
async fn abandon_releases_unpulled_work_only() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let pulled = submit(&d, request("m", 10));
    let unpulled = submit(&d, request("m", 10));
    // Pull takes the oldest assigned request first.
    d.pull_next("r1", &RequestFilter::any()).await.unwrap();
    assert_eq!(d.status(pulled.request_id), Some(RequestStatus::Dispatched));
    assert_eq!(d.status(unpulled.request_id), Some(RequestStatus::Assigned));

    d.abandon(unpulled.request_id);
    assert_eq!(d.status(unpulled.request_id), None);
    assert_eq!(d.active_slots("r1"), Some(1));

    d.abandon(pulled.request_id);
    assert_eq!(d.status(pulled.request_id), Some(RequestStatus::Dispatched));
    assert_eq!(d.active_slots("r1"), Some(1));
    d.complete(pulled.request_id).unwrap();
    assert_eq!(d.active_slots("r1"), Some(0));
}

#[tokio::test]
async fn runner_finish_releases_abandoned_slot() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10));
    let held = submit(&d, request("m", 10));
    let waiting = submit(&d, request("m", 10));
    d.pull_next("r1", &RequestFilter::any()).await.unwrap();
    d.abandon(held.request_id);
    assert_eq!(d.active_slots("r1"), Some(1));

    d.runner_finished("r1", held.request_id, RequestStatus::Completed).unwrap();
    assert_eq!(d.status(held.request_id), None);
    assert_eq!(d.status(waiting.request_id), Some(RequestStatus::Assigned));
    assert!(matches!(
        d.runner_finished("r1", held.request_id, RequestStatus::Completed),
        Err(DispatchError::UnknownRequest(_))
    ));
}

#[test]
fn runner_finish_requires_lease_and_terminal_status() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10));
    d.update_runner(RunnerReport::new("r2", 10));
    let sub = submit(&d, request("m", 10));
    let holder = d.assigned_runner(sub.request_id).unwrap();
    let other = if holder == "r1" { "r2" } else { "r1" };

    assert!(matches!(
        d.runner_finished(other, sub.request_id, RequestStatus::Completed),
        Err(DispatchError::UnknownRequest(_))
    ));
    assert!(matches!(
        d.runner_finished(&holder, sub.request_id, RequestStatus::Dispatched),
        Err(DispatchError::InvalidRequest(_))
    ));
    assert_eq!(d.status(sub.request_id), Some(RequestStatus::Assigned));
    d.runner_finished(&holder, sub.request_id, RequestStatus::Failed).unwrap();
    assert_eq!(d.active_slots(&holder), Some(0));
}

#[test]
fn abandon_removes_queued_request() {
    let d = dispatcher();
    let sub = submit(&d, request("m", 10));
    d.abandon(sub.request_id);
    assert_eq!(d.queue_len(), 0);
    assert!(matches!(d.complete(sub.request_id), Err(DispatchError::UnknownRequest(_))));
}

#[test]
fn dropped_guard_abandons_request() {
    let d = Arc::new(dispatcher());
    d.update_runner(RunnerReport::new("r1", 100));
    let sub = submit(&d, request("m", 10));
    {
        let _guard = d.guard(sub.request_id);
    }
    assert_eq!(d.status(sub.request_id), None);
    assert_eq!(d.active_slots("r1"), Some(0));

    let sub = submit(&d, request("m", 10));
    let mut guard = d.guard(sub.request_id);
    guard.complete();
    drop(guard);
    assert_eq!(d.active_slots("r1"), Some(0));
}

#[test]
fn snapshot_reports_runners_and_queue() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 10).with_model("m", 0));
    submit(&d, request("m", 10));
    submit(&d, request("m", 10));

    let snap = d.snapshot();
    assert_eq!(snap.strategy, "max_spread");
    assert_eq!(snap.runners.len(), 1);
    assert_eq!(snap.runners[0].allocated_memory, 10);
    assert_eq!(snap.runners[0].models, vec!["m".to_string()]);
    assert_eq!(snap.queue_depth, 1);
    assert_eq!(snap.in_flight, 1);
    assert_eq!(snap.decisions.len(), 2);
    assert!(serde_json::to_string(&snap).is_ok());
}

#[test]
fn failure_watch_stays_pending_after_normal_completion() {
    let d = dispatcher();
    d.update_runner(RunnerReport::new("r1", 100));
    let mut sub = submit(&d, request("m", 10));
    d.complete(sub.request_id).unwrap();

    let mut wait = tokio_test::task::spawn(sub.failure.wait());
    tokio_test::assert_pending!(wait.poll());
}
