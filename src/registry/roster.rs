//! In-memory runner registry.
//!
//! Pure state: no I/O, no locking. The dispatcher owns one registry and
//! mutates it inside its critical section so that eligibility checks and
//! slot reservation can never interleave with another writer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::runner::{Runner, RunnerReport, Slot, SlotId};
use crate::protocol::RequestId;

/// Policy for requests targeting a model that is not warm on a runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelEligibility {
    /// Warm runners, or runners able to load the model.
    #[default]
    ResidentOrLoadable,
    /// Only runners where the model is warm.
    ResidentOnly,
}

impl std::str::FromStr for ModelEligibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resident_or_loadable" => Ok(Self::ResidentOrLoadable),
            "resident_only" => Ok(Self::ResidentOnly),
            other => Err(format!("unknown model eligibility: {other}")),
        }
    }
}

/// What a request needs from a runner.
#[derive(Debug, Clone, Copy)]
pub struct Demand<'a> {
    pub model: Option<&'a str>,
    pub memory: u64,
}

/// Read-only view of an eligible runner handed to placement strategies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub runner_id: String,
    pub registered_seq: u64,
    pub active_slots: usize,
    pub allocated_memory: u64,
    pub free_memory: u64,
    pub total_memory: u64,
    /// The requested model is already warm on this runner.
    pub warm: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReserveError {
    #[error("Runner not registered: {0}")]
    UnknownRunner(String),

    #[error("Runner {runner_id} has {free} free, request needs {needed}")]
    InsufficientCapacity { runner_id: String, free: u64, needed: u64 },

    #[error("Runner {0} cannot serve the requested model")]
    Incompatible(String),
}

/// Timing windows the registry applies.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub runner_ttl: Duration,
    pub model_ttl: Duration,
    pub eligibility: ModelEligibility,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            runner_ttl: Duration::from_secs(30),
            model_ttl: Duration::from_secs(10),
            eligibility: ModelEligibility::default(),
        }
    }
}

pub struct RunnerRegistry {
    runners: HashMap<String, Runner>,
    next_seq: u64,
    config: RegistryConfig,
}

impl RunnerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self { runners: HashMap::new(), next_seq: 0, config }
    }

    /// Upsert a runner from its report and refresh its heartbeat.
    /// Returns true when the runner was not registered before.
    pub fn update(&mut self, report: RunnerReport, now: Instant) -> bool {
        if let Some(runner) = self.runners.get_mut(&report.runner_id) {
            runner.apply(report, now);
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        let runner = Runner::from_report(report, seq, now);
        self.runners.insert(runner.id.clone(), runner);
        true
    }

    /// Remove runners whose heartbeat is older than the liveness window.
    /// The removed runners are returned with their slots still attached so
    /// the caller can fail or re-place the affected requests.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<Runner> {
        let ttl = self.config.runner_ttl;
        let expired: Vec<String> = self
            .runners
            .values()
            .filter(|r| r.is_expired(now, ttl))
            .map(|r| r.id.clone())
            .collect();
        expired.into_iter().filter_map(|id| self.runners.remove(&id)).collect()
    }

    /// Release slots older than `slot_ttl`, returning `(runner_id, slot)`.
    pub fn expire_slots(&mut self, now: Instant, slot_ttl: Duration) -> Vec<(String, Slot)> {
        let mut expired = Vec::new();
        for runner in self.runners.values_mut() {
            let ids: Vec<SlotId> = runner
                .slots
                .values()
                .filter(|s| s.is_expired(now, slot_ttl))
                .map(|s| s.id)
                .collect();
            for id in ids {
                if let Some(slot) = runner.slots.remove(&id) {
                    expired.push((runner.id.clone(), slot));
                }
            }
        }
        expired
    }

    fn serves_model(&self, runner: &Runner, model: Option<&str>, now: Instant) -> bool {
        let Some(model) = model else { return true };
        if runner.is_warm(model, now, self.config.model_ttl) {
            return true;
        }
        match self.config.eligibility {
            ModelEligibility::ResidentOrLoadable => runner.can_load(model),
            ModelEligibility::ResidentOnly => false,
        }
    }

    /// Runners with enough free memory that can serve the requested model,
    /// ordered by registration.
    pub fn list_eligible(&self, demand: Demand<'_>, now: Instant) -> Vec<Candidate> {
        let model_ttl = self.config.model_ttl;
        let mut eligible: Vec<Candidate> = self
            .runners
            .values()
            .filter(|r| self.serves_model(r, demand.model, now))
            .filter_map(|r| {
                let free = r.free_memory(now, model_ttl, demand.model);
                (free >= demand.memory).then(|| Candidate {
                    runner_id: r.id.clone(),
                    registered_seq: r.registered_seq,
                    active_slots: r.active_slots(),
                    allocated_memory: r.allocated_memory(),
                    free_memory: free,
                    total_memory: r.total_memory,
                    warm: demand.model.is_some_and(|m| r.is_warm(m, now, model_ttl)),
                })
            })
            .collect();
        eligible.sort_by_key(|c| c.registered_seq);
        eligible
    }

    /// Runners that could serve the request once their slots free up: the
    /// model is servable and total memory covers the demand.
    pub fn compatible_runners(&self, demand: Demand<'_>, now: Instant) -> Vec<String> {
        self.runners
            .values()
            .filter(|r| r.total_memory >= demand.memory)
            .filter(|r| self.serves_model(r, demand.model, now))
            .map(|r| r.id.clone())
            .collect()
    }

    /// Create a slot on `runner_id`, re-checking capacity first.
    pub fn reserve(
        &mut self,
        runner_id: &str,
        request_id: RequestId,
        demand: Demand<'_>,
        now: Instant,
    ) -> Result<SlotId, ReserveError> {
        let model_ttl = self.config.model_ttl;
        let runner = self
            .runners
            .get(runner_id)
            .ok_or_else(|| ReserveError::UnknownRunner(runner_id.to_string()))?;
        if !self.serves_model(runner, demand.model, now) {
            return Err(ReserveError::Incompatible(runner_id.to_string()));
        }
        let free = runner.free_memory(now, model_ttl, demand.model);
        if free < demand.memory {
            return Err(ReserveError::InsufficientCapacity {
                runner_id: runner_id.to_string(),
                free,
                needed: demand.memory,
            });
        }

        let runner = self
            .runners
            .get_mut(runner_id)
            .ok_or_else(|| ReserveError::UnknownRunner(runner_id.to_string()))?;
        let slot = Slot {
            id: SlotId::new(),
            request_id,
            model: demand.model.map(str::to_string),
            memory: demand.memory,
            created_at: now,
        };
        if let Some(model) = demand.model {
            runner.touch_model(model, demand.memory, now);
        }
        let id = slot.id;
        runner.slots.insert(id, slot);
        Ok(id)
    }

    /// Release a slot. Marks its model as used so it stays warm.
    pub fn release(&mut self, runner_id: &str, slot_id: SlotId, now: Instant) -> Option<Slot> {
        let runner = self.runners.get_mut(runner_id)?;
        let slot = runner.slots.remove(&slot_id)?;
        if let Some(model) = &slot.model {
            runner.touch_model(model, slot.memory, now);
        }
        Some(slot)
    }

    pub fn get(&self, runner_id: &str) -> Option<&Runner> {
        self.runners.get(runner_id)
    }

    pub fn contains(&self, runner_id: &str) -> bool {
        self.runners.contains_key(runner_id)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Runners in registration order.
    pub fn runners(&self) -> Vec<&Runner> {
        let mut runners: Vec<&Runner> = self.runners.values().collect();
        runners.sort_by_key(|r| r.registered_seq);
        runners
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

#[cfg(test)]
#[path = "roster_tests.rs"]
mod tests;
