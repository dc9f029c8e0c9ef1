//! Dispatcher: owns the registry, pending queue and decision log.
//!
//! All scheduler state sits behind one lock. Eligibility, slot reservation,
//! eviction and queue draining happen inside the same critical section, so
//! a runner's capacity can never be checked by one task and consumed by
//! another in between. Nothing awaits while the lock is held; callers wait
//! on their own response subscription instead.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};

use super::decision::{DecisionLog, DecisionOutcome, DecisionOverflow, SchedulingDecision};
use super::queue::{PendingQueue, PendingQueueConfig};
use super::request::{InferenceRequest, RequestFilter, RequestStatus};
use super::strategy::{PlacementStrategy, SchedulingStrategy};
use crate::error::DispatchError;
use crate::protocol::RequestId;
use crate::registry::{RegistryConfig, Runner, RunnerRegistry, RunnerReport, SlotId};
use crate::telemetry;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub registry: RegistryConfig,
    /// Slot liveness window.
    pub slot_ttl: Duration,
    pub queue: PendingQueueConfig,
    pub decision_buffer_size: usize,
    pub decision_overflow: DecisionOverflow,
    pub strategy: SchedulingStrategy,
    /// Upper bound on how long a pull suspends waiting for work.
    pub pull_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            slot_ttl: Duration::from_secs(300),
            queue: PendingQueueConfig::default(),
            decision_buffer_size: 10,
            decision_overflow: DecisionOverflow::default(),
            strategy: SchedulingStrategy::default(),
            pull_wait: Duration::from_secs(1),
        }
    }
}

/// Where a submitted request ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Runner(String),
    Queued { position: usize },
}

/// Receives the dispatcher's verdict when a request fails outside the
/// response channel (runner loss, slot expiry).
#[derive(Debug)]
pub struct FailureWatch {
    rx: Option<oneshot::Receiver<DispatchError>>,
}

impl FailureWatch {
    /// Resolves with the failure. Pends forever once the dispatcher has
    /// let go of the request without failing it.
    pub async fn wait(&mut self) -> DispatchError {
        if let Some(rx) = self.rx.as_mut() {
            let result = rx.await;
            self.rx = None;
            if let Ok(err) = result {
                return err;
            }
        }
        std::future::pending().await
    }

    /// Non-blocking check.
    pub fn try_take(&mut self) -> Option<DispatchError> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(err) => {
                self.rx = None;
                Some(err)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                None
            }
        }
    }
}

/// Handle returned by a successful submission.
#[derive(Debug)]
pub struct Submission {
    pub request_id: RequestId,
    pub placement: Placement,
    pub failure: FailureWatch,
}

/// Outcome of one eviction/expiry sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_runners: Vec<String>,
    pub expired_slots: usize,
    pub failed_requests: usize,
    pub placed_from_queue: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub runner_id: String,
    pub total_memory: u64,
    pub allocated_memory: u64,
    pub active_slots: usize,
    pub models: Vec<String>,
    pub heartbeat_age_ms: u64,
}

/// Serializable view of scheduler state for dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherSnapshot {
    pub strategy: String,
    pub runners: Vec<RunnerSnapshot>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub decisions: Vec<SchedulingDecision>,
    pub decisions_dropped: u64,
}

struct Tracked {
    request: InferenceRequest,
    status: RequestStatus,
    lease: Option<(String, SlotId)>,
    failure_tx: Option<oneshot::Sender<DispatchError>>,
}

type Notice = (oneshot::Sender<DispatchError>, DispatchError);

struct State {
    registry: RunnerRegistry,
    queue: PendingQueue<RequestId>,
    decisions: DecisionLog,
    requests: HashMap<RequestId, Tracked>,
    /// Assigned requests per runner, in placement order.
    inboxes: HashMap<String, VecDeque<RequestId>>,
}

impl State {
    fn decide(&mut self, request_id: RequestId, outcome: DecisionOutcome) {
        let label = match &outcome {
            DecisionOutcome::Placed { .. } => "placed",
            DecisionOutcome::Queued => "queued",
            DecisionOutcome::Rejected => "rejected",
        };
        telemetry::record_decision(label);
        let model = self.requests.get(&request_id).and_then(|t| t.request.model.clone());
        self.decisions.record(SchedulingDecision::new(request_id, model, outcome));
    }

    /// Try to place one tracked request, skipping runners in `claimed`.
    fn try_place(
        &mut self,
        id: RequestId,
        claimed: &HashSet<String>,
        strategy: &dyn PlacementStrategy,
        now: Instant,
    ) -> Option<String> {
        let tracked = self.requests.get(&id)?;
        let demand = tracked.request.demand();
        let mut eligible = self.registry.list_eligible(demand, now);
        eligible.retain(|c| !claimed.contains(&c.runner_id));
        let runner_id = strategy.choose(&eligible, &tracked.request)?.runner_id.clone();

        let slot = match self.registry.reserve(&runner_id, id, demand, now) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(request_id = %id, runner_id = %runner_id, error = %e, "slot reservation lost");
                return None;
            }
        };
        if let Some(tracked) = self.requests.get_mut(&id) {
            tracked.status = RequestStatus::Assigned;
            tracked.lease = Some((runner_id.clone(), slot));
        }
        self.inboxes.entry(runner_id.clone()).or_default().push_back(id);
        self.decide(id, DecisionOutcome::Placed { runner_id: runner_id.clone() });
        tracing::debug!(request_id = %id, runner_id = %runner_id, "request placed");
        Some(runner_id)
    }

    /// Place queued requests in FIFO order. A request that cannot be placed
    /// claims every runner that could ever fit it, so nothing behind it may
    /// take those runners first. Returns the number placed and the
    /// claims left by requests still queued.
    fn drain_queue(&mut self, strategy: &dyn PlacementStrategy, now: Instant) -> (usize, HashSet<String>) {
        let mut claimed = HashSet::new();
        let mut placed = Vec::new();
        let waiting: Vec<RequestId> = self.queue.iter().copied().collect();
        for id in waiting {
            if self.try_place(id, &claimed, strategy, now).is_some() {
                placed.push(id);
                continue;
            }
            if let Some(tracked) = self.requests.get(&id) {
                claimed.extend(self.registry.compatible_runners(tracked.request.demand(), now));
            }
        }
        let placed_set: HashSet<RequestId> = placed.iter().copied().collect();
        self.queue.retain(|id| !placed_set.contains(id));
        telemetry::record_queue_depth(self.queue.len());
        (placed.len(), claimed)
    }

    /// Remove a request and hand back its failure notice.
    fn fail(&mut self, id: RequestId, err: DispatchError, notices: &mut Vec<Notice>) {
        let Some(mut tracked) = self.requests.remove(&id) else { return };
        tracked.status = RequestStatus::Failed;
        telemetry::record_finished("failed");
        telemetry::record_failure(err.kind());
        if err.is_warning() {
            tracing::warn!(request_id = %id, error = %err, "request failed");
        } else {
            tracing::error!(request_id = %id, error = %err, "request failed");
        }
        if let Some(tx) = tracked.failure_tx.take() {
            notices.push((tx, err));
        }
    }

    fn remove_from_inbox(&mut self, runner_id: &str, id: RequestId) {
        if let Some(inbox) = self.inboxes.get_mut(runner_id) {
            inbox.retain(|r| *r != id);
        }
    }

    fn evict(&mut self, now: Instant, notices: &mut Vec<Notice>) -> Vec<String> {
        let evicted: Vec<Runner> = self.registry.evict_expired(now);
        if evicted.is_empty() {
            return Vec::new();
        }
        telemetry::record_eviction(evicted.len());
        telemetry::record_runner_count(self.registry.len());
        let mut ids = Vec::with_capacity(evicted.len());
        for runner in evicted {
            tracing::warn!(runner_id = runner.id(), slots = runner.active_slots(), "runner evicted");
            self.inboxes.remove(runner.id());
            for slot in runner.slots() {
                let err = DispatchError::RunnerLost { runner_id: runner.id().to_string() };
                self.fail(slot.request_id, err, notices);
            }
            ids.push(runner.id().to_string());
        }
        ids
    }

    fn expire_slots(&mut self, now: Instant, slot_ttl: Duration, notices: &mut Vec<Notice>) -> usize {
        let expired = self.registry.expire_slots(now, slot_ttl);
        for (runner_id, slot) in &expired {
            tracing::warn!(runner_id = %runner_id, request_id = %slot.request_id, "slot expired");
            self.remove_from_inbox(runner_id, slot.request_id);
            self.fail(slot.request_id, DispatchError::Timeout(slot_ttl), notices);
        }
        expired.len()
    }

    /// Drop a request's slot and tracking entry.
    fn finish(&mut self, id: RequestId, status: RequestStatus, now: Instant) -> Result<(), DispatchError> {
        let tracked = self
            .requests
            .remove(&id)
            .ok_or_else(|| DispatchError::UnknownRequest(id.to_string()))?;
        match tracked.status {
            RequestStatus::Queued => {
                self.queue.remove(&id);
                telemetry::record_queue_depth(self.queue.len());
            }
            RequestStatus::Assigned | RequestStatus::Dispatched => {
                if let Some((runner_id, slot)) = &tracked.lease {
                    self.remove_from_inbox(runner_id, id);
                    self.registry.release(runner_id, *slot, now);
                }
            }
            RequestStatus::Completed | RequestStatus::Failed => {}
        }
        telemetry::record_finished(match status {
            RequestStatus::Completed => "completed",
            _ => "failed",
        });
        Ok(())
    }
}

/// Places requests on runners and hands them out through pulls.
pub struct Dispatcher {
    state: Mutex<State>,
    strategy: Box<dyn PlacementStrategy>,
    work_ready: Notify,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        let strategy = config.strategy.build();
        Self::with_strategy(config, strategy)
    }

    /// Use a custom placement strategy instead of the configured one.
    pub fn with_strategy(config: DispatcherConfig, strategy: Box<dyn PlacementStrategy>) -> Self {
        let state = State {
            registry: RunnerRegistry::new(config.registry),
            queue: PendingQueue::new(config.queue),
            decisions: DecisionLog::new(config.decision_buffer_size, config.decision_overflow),
            requests: HashMap::new(),
            inboxes: HashMap::new(),
        };
        Self { state: Mutex::new(state), strategy, work_ready: Notify::new(), config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Ingest a runner report. Returns true if the runner is new.
    pub fn update_runner(&self, report: RunnerReport) -> bool {
        self.update_runner_at(report, Instant::now())
    }

    pub fn update_runner_at(&self, report: RunnerReport, now: Instant) -> bool {
        let mut notices = Vec::new();
        let (registered, placed) = {
            let mut state = self.state.lock();
            state.evict(now, &mut notices);
            let runner_id = report.runner_id.clone();
            let registered = state.registry.update(report, now);
            if registered {
                tracing::info!(runner_id = %runner_id, "runner registered");
                telemetry::record_runner_count(state.registry.len());
            }
            let (placed, _) = state.drain_queue(self.strategy.as_ref(), now);
            (registered, placed)
        };
        self.settle(notices, placed);
        registered
    }

    /// Place a request, queue it, or reject it with backpressure.
    pub fn submit(&self, request: InferenceRequest) -> Result<Submission, DispatchError> {
        let now = Instant::now();
        let request_id = request.id;
        let (tx, rx) = oneshot::channel();
        let mut notices = Vec::new();

        let (result, placed) = {
            let mut state = self.state.lock();
            if state.requests.contains_key(&request_id) {
                return Err(DispatchError::InvalidRequest(format!("duplicate request id {request_id}")));
            }
            state.evict(now, &mut notices);
            let (mut placed, claimed) = state.drain_queue(self.strategy.as_ref(), now);

            state.requests.insert(
                request_id,
                Tracked { request, status: RequestStatus::Queued, lease: None, failure_tx: Some(tx) },
            );

            let result = if let Some(runner_id) =
                state.try_place(request_id, &claimed, self.strategy.as_ref(), now)
            {
                placed += 1;
                Ok(Placement::Runner(runner_id))
            } else {
                match state.queue.try_push(request_id) {
                    Ok(position) => {
                        state.decide(request_id, DecisionOutcome::Queued);
                        telemetry::record_queue_depth(state.queue.len());
                        tracing::debug!(request_id = %request_id, position, "request queued");
                        Ok(Placement::Queued { position })
                    }
                    Err(_) => {
                        state.decide(request_id, DecisionOutcome::Rejected);
                        state.requests.remove(&request_id);
                        let capacity = state.queue.capacity();
                        tracing::warn!(request_id = %request_id, capacity, "pending queue full, rejecting");
                        Err(DispatchError::QueueFull { capacity })
                    }
                }
            };
            (result, placed)
        };

        self.settle(notices, placed);
        result.map(|placement| Submission {
            request_id,
            placement,
            failure: FailureWatch { rx: Some(rx) },
        })
    }

    /// Take the next assigned request for `runner_id` matching `filter`,
    /// suspending up to the configured pull wait if none is ready.
    pub async fn pull_next(
        &self,
        runner_id: &str,
        filter: &RequestFilter,
    ) -> Result<Option<InferenceRequest>, DispatchError> {
        self.pull_next_within(runner_id, filter, self.config.pull_wait).await
    }

    /// Like [`pull_next`](Self::pull_next) with an explicit wait bound.
    /// A zero wait checks once and returns.
    pub async fn pull_next_within(
        &self,
        runner_id: &str,
        filter: &RequestFilter,
        wait: Duration,
    ) -> Result<Option<InferenceRequest>, DispatchError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.try_pull(runner_id, filter)? {
                return Ok(Some(request));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn try_pull(
        &self,
        runner_id: &str,
        filter: &RequestFilter,
    ) -> Result<Option<InferenceRequest>, DispatchError> {
        let mut state = self.state.lock();
        if !state.registry.contains(runner_id) {
            return Err(DispatchError::UnknownRunner(runner_id.to_string()));
        }
        let State { inboxes, requests, .. } = &mut *state;
        let Some(inbox) = inboxes.get_mut(runner_id) else { return Ok(None) };
        let position = inbox
            .iter()
            .position(|id| requests.get(id).is_some_and(|t| filter.matches(&t.request)));
        let Some(id) = position.and_then(|idx| inbox.remove(idx)) else { return Ok(None) };
        let Some(tracked) = requests.get_mut(&id) else { return Ok(None) };
        tracked.status = RequestStatus::Dispatched;
        tracing::debug!(request_id = %id, runner_id, "request dispatched");
        Ok(Some(tracked.request.clone()))
    }

    /// Mark a request completed and release its slot.
    pub fn complete(&self, request_id: RequestId) -> Result<(), DispatchError> {
        self.finish(request_id, RequestStatus::Completed)
    }

    /// Mark a request failed and release its slot.
    pub fn fail(&self, request_id: RequestId, reason: &DispatchError) -> Result<(), DispatchError> {
        tracing::debug!(request_id = %request_id, error = %reason, "request failed by caller side");
        self.finish(request_id, RequestStatus::Failed)?;
        telemetry::record_failure(reason.kind());
        Ok(())
    }

    /// The runner published a terminal response. Releases the slot even
    /// when the caller has already gone away. Only the runner holding the
    /// request's lease may settle it.
    pub fn runner_finished(
        &self,
        runner_id: &str,
        request_id: RequestId,
        status: RequestStatus,
    ) -> Result<(), DispatchError> {
        if !status.is_terminal() {
            return Err(DispatchError::InvalidRequest(format!("{status:?} is not a terminal status")));
        }
        let now = Instant::now();
        let placed = {
            let mut state = self.state.lock();
            let holds_lease = state
                .requests
                .get(&request_id)
                .and_then(|t| t.lease.as_ref())
                .is_some_and(|(runner, _)| runner == runner_id);
            if !holds_lease {
                return Err(DispatchError::UnknownRequest(request_id.to_string()));
            }
            state.finish(request_id, status, now)?;
            tracing::debug!(request_id = %request_id, runner_id, ?status, "runner finished request");
            state.drain_queue(self.strategy.as_ref(), now).0
        };
        self.settle(Vec::new(), placed);
        Ok(())
    }

    fn finish(&self, request_id: RequestId, status: RequestStatus) -> Result<(), DispatchError> {
        let now = Instant::now();
        let placed = {
            let mut state = self.state.lock();
            state.finish(request_id, status, now)?;
            state.drain_queue(self.strategy.as_ref(), now).0
        };
        self.settle(Vec::new(), placed);
        Ok(())
    }

    /// The caller went away. Work the runner has not seen is withdrawn and
    /// its slot released; work already pulled keeps its slot until the
    /// runner publishes its terminal response or the slot expires.
    pub fn abandon(&self, request_id: RequestId) {
        let now = Instant::now();
        let placed = {
            let mut state = self.state.lock();
            let Some(tracked) = state.requests.get_mut(&request_id) else { return };
            if tracked.status == RequestStatus::Dispatched {
                tracked.failure_tx = None;
                tracing::debug!(request_id = %request_id, "caller abandoned dispatched request");
                return;
            }
            tracing::debug!(request_id = %request_id, "caller abandoned request before dispatch");
            if state.finish(request_id, RequestStatus::Failed, now).is_err() {
                return;
            }
            state.drain_queue(self.strategy.as_ref(), now).0
        };
        self.settle(Vec::new(), placed);
    }

    /// Evict dead runners and expire stale slots.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut notices = Vec::new();
        let report = {
            let mut state = self.state.lock();
            let evicted_runners = state.evict(now, &mut notices);
            let expired_slots = state.expire_slots(now, self.config.slot_ttl, &mut notices);
            let (placed_from_queue, _) = state.drain_queue(self.strategy.as_ref(), now);
            SweepReport {
                evicted_runners,
                expired_slots,
                failed_requests: notices.len(),
                placed_from_queue,
            }
        };
        self.settle(notices, report.placed_from_queue);
        report
    }

    /// Deliver failure notices and wake pullers, outside the lock.
    fn settle(&self, notices: Vec<Notice>, placed: usize) {
        for (tx, err) in notices {
            let _ = tx.send(err);
        }
        if placed > 0 {
            self.work_ready.notify_waiters();
        }
    }

    pub fn status(&self, request_id: RequestId) -> Option<RequestStatus> {
        self.state.lock().requests.get(&request_id).map(|t| t.status)
    }

    /// Runner currently holding the request's slot.
    pub fn assigned_runner(&self, request_id: RequestId) -> Option<String> {
        let state = self.state.lock();
        state.requests.get(&request_id)?.lease.as_ref().map(|(runner, _)| runner.clone())
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn runner_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn active_slots(&self, runner_id: &str) -> Option<usize> {
        self.state.lock().registry.get(runner_id).map(Runner::active_slots)
    }

    pub fn decisions(&self) -> Vec<SchedulingDecision> {
        self.state.lock().decisions.snapshot()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        let runners = state
            .registry
            .runners()
            .into_iter()
            .map(|r| {
                let mut models: Vec<String> = r.resident_models().map(str::to_string).collect();
                models.sort();
                RunnerSnapshot {
                    runner_id: r.id().to_string(),
                    total_memory: r.total_memory(),
                    allocated_memory: r.allocated_memory(),
                    active_slots: r.active_slots(),
                    models,
                    heartbeat_age_ms: now.saturating_duration_since(r.last_heartbeat()).as_millis() as u64,
                }
            })
            .collect();
        DispatcherSnapshot {
            strategy: self.strategy.name().to_string(),
            runners,
            queue_depth: state.queue.len(),
            queue_capacity: state.queue.capacity(),
            in_flight: state
                .requests
                .values()
                .filter(|t| t.status != RequestStatus::Queued)
                .count(),
            decisions: state.decisions.snapshot(),
            decisions_dropped: state.decisions.dropped(),
        }
    }

    /// RAII guard that abandons the request unless it is settled first.
    pub fn guard(self: &Arc<Self>, request_id: RequestId) -> RequestGuard {
        RequestGuard { dispatcher: Arc::clone(self), request_id, settled: false }
    }
}

/// Ties a caller's wait to the request's lifecycle in the dispatcher.
pub struct RequestGuard {
    dispatcher: Arc<Dispatcher>,
    request_id: RequestId,
    settled: bool,
}

impl RequestGuard {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn complete(&mut self) {
        if !std::mem::replace(&mut self.settled, true) {
            let _ = self.dispatcher.complete(self.request_id);
        }
    }

    pub fn fail(&mut self, reason: &DispatchError) {
        if !std::mem::replace(&mut self.settled, true) {
            let _ = self.dispatcher.fail(self.request_id, reason);
        }
    }

    /// The dispatcher already finished the request on its own.
    pub fn disarm(&mut self) {
        self.settled = true;
    }

    pub fn abandon(&mut self) {
        if !std::mem::replace(&mut self.settled, true) {
            self.dispatcher.abandon(self.request_id);
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.abandon();
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
