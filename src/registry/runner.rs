//! Runner capacity snapshot and slot leases.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::RequestId;

/// A model a runner reports as loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResidentModel {
    pub name: String,
    /// Memory the loaded model holds on the runner.
    #[serde(default)]
    pub memory: u64,
}

/// Periodic capacity/heartbeat report sent by a runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerReport {
    pub runner_id: String,
    pub total_memory: u64,
    #[serde(default)]
    pub models: Vec<ResidentModel>,
    /// Models the runner is able to load. `None` means any model.
    #[serde(default)]
    pub loadable_models: Option<Vec<String>>,
}

impl RunnerReport {
    pub fn new(runner_id: impl Into<String>, total_memory: u64) -> Self {
        Self { runner_id: runner_id.into(), total_memory, ..Default::default() }
    }

    pub fn with_model(mut self, name: impl Into<String>, memory: u64) -> Self {
        self.models.push(ResidentModel { name: name.into(), memory });
        self
    }

    pub fn with_loadable(mut self, models: &[&str]) -> Self {
        self.loadable_models = Some(models.iter().map(|m| m.to_string()).collect());
        self
    }
}

/// Unique identity of a slot lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(Uuid);

impl SlotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SlotId {
    fn default() -> Self {
        Self::new()
    }
}

/// Lease binding one runner to one in-flight request.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub request_id: RequestId,
    pub model: Option<String>,
    pub memory: u64,
    pub created_at: Instant,
}

impl Slot {
    pub fn is_expired(&self, now: Instant, slot_ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > slot_ttl
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WarmModel {
    pub memory: u64,
    pub last_used: Instant,
}

/// Live facts about one runner.
#[derive(Debug, Clone)]
pub struct Runner {
    pub(crate) id: String,
    pub(crate) registered_seq: u64,
    pub(crate) total_memory: u64,
    pub(crate) models: HashMap<String, WarmModel>,
    pub(crate) loadable: Option<HashSet<String>>,
    pub(crate) slots: HashMap<SlotId, Slot>,
    pub(crate) last_heartbeat: Instant,
}

impl Runner {
    pub(crate) fn from_report(report: RunnerReport, registered_seq: u64, now: Instant) -> Self {
        let mut runner = Self {
            id: report.runner_id.clone(),
            registered_seq,
            total_memory: 0,
            models: HashMap::new(),
            loadable: None,
            slots: HashMap::new(),
            last_heartbeat: now,
        };
        runner.apply(report, now);
        runner
    }

    /// Last-write-wins update of capacity and models. Keeps the last-used
    /// time of models that were already resident.
    pub(crate) fn apply(&mut self, report: RunnerReport, now: Instant) {
        self.total_memory = report.total_memory;
        self.loadable = report.loadable_models.map(|m| m.into_iter().collect());
        let mut models = HashMap::with_capacity(report.models.len());
        for model in report.models {
            let last_used = self.models.get(&model.name).map(|m| m.last_used).unwrap_or(now);
            models.insert(model.name, WarmModel { memory: model.memory, last_used });
        }
        self.models = models;
        self.last_heartbeat = now;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registered_seq(&self) -> u64 {
        self.registered_seq
    }

    pub fn total_memory(&self) -> u64 {
        self.total_memory
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }

    pub fn active_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn resident_models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn is_expired(&self, now: Instant, runner_ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_heartbeat) > runner_ttl
    }

    pub fn allocated_memory(&self) -> u64 {
        self.slots.values().map(|s| s.memory).sum()
    }

    /// Resident and used within the warm-retention window.
    pub fn is_warm(&self, model: &str, now: Instant, model_ttl: Duration) -> bool {
        self.models
            .get(model)
            .is_some_and(|m| now.saturating_duration_since(m.last_used) <= model_ttl)
    }

    pub fn can_load(&self, model: &str) -> bool {
        self.models.contains_key(model)
            || self.loadable.as_ref().map_or(true, |set| set.contains(model))
    }

    /// Memory held by warm models that no slot is using, other than `except`.
    /// Such models keep their memory until their retention window lapses.
    fn reserved_warm_memory(&self, now: Instant, model_ttl: Duration, except: Option<&str>) -> u64 {
        self.models
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != except)
            .filter(|(name, _)| self.is_warm(name, now, model_ttl))
            .filter(|(name, _)| !self.slots.values().any(|s| s.model.as_deref() == Some(name.as_str())))
            .map(|(_, m)| m.memory)
            .sum()
    }

    /// Free memory available to a request for `model`.
    pub fn free_memory(&self, now: Instant, model_ttl: Duration, model: Option<&str>) -> u64 {
        let used = self.allocated_memory() + self.reserved_warm_memory(now, model_ttl, model);
        self.total_memory.saturating_sub(used)
    }

    pub(crate) fn touch_model(&mut self, model: &str, memory: u64, now: Instant) {
        self.models
            .entry(model.to_string())
            .and_modify(|m| m.last_used = now)
            .or_insert(WarmModel { memory, last_used: now });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[test]
    fn warm_models_hold_memory_until_lapsed() {
        let now = Instant::now();
        let runner = Runner::from_report(
            RunnerReport::new("r1", 100).with_model("llama3", 40),
            0,
            now,
        );
        assert_eq!(runner.free_memory(now, TTL, Some("phi3")), 60);
        // The requested model's own memory is not held against it.
        assert_eq!(runner.free_memory(now, TTL, Some("llama3")), 100);
        let later = now + TTL + Duration::from_secs(1);
        assert_eq!(runner.free_memory(later, TTL, Some("phi3")), 100);
        assert!(!runner.is_warm("llama3", later, TTL));
    }

    #[test]
    fn report_keeps_last_used_of_resident_models() {
        let t0 = Instant::now();
        let mut runner = Runner::from_report(RunnerReport::new("r1", 100).with_model("m", 10), 0, t0);
        let t1 = t0 + Duration::from_secs(5);
        runner.apply(RunnerReport::new("r1", 200).with_model("m", 10), t1);
        assert_eq!(runner.total_memory(), 200);
        assert_eq!(runner.models["m"].last_used, t0);
        assert_eq!(runner.last_heartbeat(), t1);
    }

    #[test]
    fn loadable_set_restricts_models() {
        let now = Instant::now();
        let open = Runner::from_report(RunnerReport::new("r1", 10), 0, now);
        assert!(open.can_load("anything"));
        let closed = Runner::from_report(RunnerReport::new("r2", 10).with_loadable(&["phi3"]), 1, now);
        assert!(closed.can_load("phi3"));
        assert!(!closed.can_load("llama3"));
    }
}
