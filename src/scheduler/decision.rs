//! Bounded diagnostic log of placement decisions.
//!
//! Observability only; placement never reads it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::RequestId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecisionOutcome {
    Placed { runner_id: String },
    Queued,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingDecision {
    pub request_id: RequestId,
    pub model: Option<String>,
    #[serde(flatten)]
    pub outcome: DecisionOutcome,
    pub at: DateTime<Utc>,
}

impl SchedulingDecision {
    pub fn new(request_id: RequestId, model: Option<String>, outcome: DecisionOutcome) -> Self {
        Self { request_id, model, outcome, at: Utc::now() }
    }

    pub fn runner_id(&self) -> Option<&str> {
        match &self.outcome {
            DecisionOutcome::Placed { runner_id } => Some(runner_id),
            _ => None,
        }
    }
}

/// What to discard when the log is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOverflow {
    #[default]
    DropOldest,
    DropNewest,
}

impl std::str::FromStr for DecisionOverflow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            other => Err(format!("unknown decision overflow policy: {other}")),
        }
    }
}

pub struct DecisionLog {
    entries: VecDeque<SchedulingDecision>,
    capacity: usize,
    overflow: DecisionOverflow,
    dropped: u64,
}

impl DecisionLog {
    pub fn new(capacity: usize, overflow: DecisionOverflow) -> Self {
        Self { entries: VecDeque::with_capacity(capacity), capacity, overflow, dropped: 0 }
    }

    pub fn record(&mut self, decision: SchedulingDecision) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            match self.overflow {
                DecisionOverflow::DropOldest => {
                    self.entries.pop_front();
                }
                DecisionOverflow::DropNewest => return,
            }
        }
        self.entries.push_back(decision);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<SchedulingDecision> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries discarded since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
