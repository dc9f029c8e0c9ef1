//! Placement strategies.
//!
//! A strategy is a pure, deterministic choice over the eligible runners.
//! It never mutates the registry or the request.

use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::request::InferenceRequest;
use crate::registry::Candidate;

/// Chooses a runner for a request from the eligible set.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one of `eligible`, or `None`. Must return the same runner for the
    /// same input on every call.
    fn choose<'a>(&self, eligible: &'a [Candidate], request: &InferenceRequest) -> Option<&'a Candidate>;
}

/// Fewest active slots first, then a runner with the model already warm,
/// then the earliest registered runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxSpread;

impl PlacementStrategy for MaxSpread {
    fn name(&self) -> &'static str {
        "max_spread"
    }

    fn choose<'a>(&self, eligible: &'a [Candidate], _request: &InferenceRequest) -> Option<&'a Candidate> {
        eligible.iter().min_by_key(|c| (c.active_slots, !c.warm, c.registered_seq))
    }
}

/// Most allocated runner that still fits the request, so idle runners can
/// scale to zero. Ties go to more active slots, then a warm model, then
/// earliest registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinPack;

impl PlacementStrategy for BinPack {
    fn name(&self) -> &'static str {
        "bin_pack"
    }

    fn choose<'a>(&self, eligible: &'a [Candidate], _request: &InferenceRequest) -> Option<&'a Candidate> {
        eligible
            .iter()
            .max_by_key(|c| (c.allocated_memory, c.active_slots, c.warm, Reverse(c.registered_seq)))
    }
}

/// Strategy selector from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    #[default]
    MaxSpread,
    BinPack,
}

impl SchedulingStrategy {
    pub fn build(self) -> Box<dyn PlacementStrategy> {
        match self {
            Self::MaxSpread => Box::new(MaxSpread),
            Self::BinPack => Box::new(BinPack),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_spread" => Ok(Self::MaxSpread),
            "bin_pack" | "binpack" => Ok(Self::BinPack),
            other => Err(format!("unknown scheduling strategy: {other}")),
        }
    }
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxSpread => write!(f, "max_spread"),
            Self::BinPack => write!(f, "bin_pack"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatCompletionRequest;

    fn candidate(id: &str, seq: u64, active: usize, allocated: u64) -> Candidate {
        Candidate {
            runner_id: id.into(),
            registered_seq: seq,
            active_slots: active,
            allocated_memory: allocated,
            free_memory: 100 - allocated,
            total_memory: 100,
            warm: false,
        }
    }

    fn request() -> InferenceRequest {
        InferenceRequest::new("o", ChatCompletionRequest::default(), 1)
    }

    #[test]
    fn max_spread_prefers_least_loaded() {
        let eligible = vec![candidate("r2", 0, 3, 30), candidate("r1", 1, 0, 0)];
        let chosen = MaxSpread.choose(&eligible, &request()).unwrap();
        assert_eq!(chosen.runner_id, "r1");
    }

    #[test]
    fn max_spread_ties_go_to_earliest_registration() {
        let eligible = vec![candidate("late", 5, 1, 10), candidate("early", 2, 1, 10)];
        for _ in 0..10 {
            assert_eq!(MaxSpread.choose(&eligible, &request()).unwrap().runner_id, "early");
        }
    }

    #[test]
    fn max_spread_prefers_warm_runner_at_equal_load() {
        let cold = candidate("cold", 0, 0, 0);
        let warm = Candidate { warm: true, ..candidate("warm", 1, 0, 0) };
        let eligible = vec![cold, warm];
        assert_eq!(MaxSpread.choose(&eligible, &request()).unwrap().runner_id, "warm");

        // Load still comes first.
        let busy_warm = Candidate { warm: true, ..candidate("busy", 1, 2, 20) };
        let eligible = vec![candidate("idle", 0, 0, 0), busy_warm];
        assert_eq!(MaxSpread.choose(&eligible, &request()).unwrap().runner_id, "idle");
    }

    #[test]
    fn bin_pack_breaks_ties_toward_warm_runner() {
        let warm = Candidate { warm: true, ..candidate("warm", 1, 1, 10) };
        let eligible = vec![candidate("cold", 0, 1, 10), warm];
        assert_eq!(BinPack.choose(&eligible, &request()).unwrap().runner_id, "warm");
    }

    #[test]
    fn bin_pack_prefers_most_allocated() {
        let eligible = vec![candidate("idle", 0, 0, 0), candidate("busy", 1, 2, 60)];
        assert_eq!(BinPack.choose(&eligible, &request()).unwrap().runner_id, "busy");
    }

    #[test]
    fn empty_set_chooses_none() {
        assert!(MaxSpread.choose(&[], &request()).is_none());
        assert!(BinPack.choose(&[], &request()).is_none());
    }

    #[test]
    fn selector_parses_config_names() {
        assert_eq!("max_spread".parse::<SchedulingStrategy>(), Ok(SchedulingStrategy::MaxSpread));
        assert_eq!("bin_pack".parse::<SchedulingStrategy>(), Ok(SchedulingStrategy::BinPack));
        assert!("random".parse::<SchedulingStrategy>().is_err());
        assert_eq!(SchedulingStrategy::BinPack.build().name(), "bin_pack");
    }
}
