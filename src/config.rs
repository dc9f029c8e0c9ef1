//! Control plane configuration.
//!
//! Values come from compiled defaults, optionally overlaid by a TOML file,
//! then by `GG_DISPATCH_*` environment variables. Invalid environment values
//! fall back to the layer below without crashing; an invalid file is an
//! error because someone wrote it on purpose.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_DISPATCH_MODEL_TTL` | 10 | Warm-model retention window (secs) |
//! | `GG_DISPATCH_SLOT_TTL` | 300 | Slot liveness and caller response window (secs) |
//! | `GG_DISPATCH_RUNNER_TTL` | 30 | Runner heartbeat liveness window (secs) |
//! | `GG_DISPATCH_STRATEGY` | max_spread | `max_spread` or `bin_pack` |
//! | `GG_DISPATCH_QUEUE_SIZE` | 100 | Pending queue bound |
//! | `GG_DISPATCH_DECISION_BUFFER` | 10 | Decision log entries kept |
//! | `GG_DISPATCH_DECISION_OVERFLOW` | drop_oldest | `drop_oldest` or `drop_newest` |
//! | `GG_DISPATCH_MODEL_ELIGIBILITY` | resident_or_loadable | `resident_or_loadable` or `resident_only` |
//! | `GG_DISPATCH_PULL_WAIT_MS` | 1000 | Long-poll bound for runner pulls |
//! | `GG_DISPATCH_SWEEP_INTERVAL_MS` | 1000 | Background eviction sweep period |
//! | `GG_DISPATCH_DEFAULT_MODEL_MEMORY` | 1 | Request footprint for unlisted models |
//! | `GG_DISPATCH_SHUTDOWN_TIMEOUT` | 30 | Graceful drain bound (secs) |

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{ModelEligibility, RegistryConfig};
use crate::scheduler::{DecisionOverflow, DispatcherConfig, PendingQueueConfig, SchedulingStrategy};

const MIN_SWEEP_INTERVAL_MS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub model_ttl_secs: u64,
    pub slot_ttl_secs: u64,
    pub runner_ttl_secs: u64,
    pub strategy: String,
    pub queue_size: usize,
    pub decision_buffer_size: usize,
    pub decision_overflow: DecisionOverflow,
    pub model_eligibility: ModelEligibility,
    pub pull_wait_ms: u64,
    pub sweep_interval_ms: u64,
    pub default_model_memory: u64,
    pub model_memory_entries: usize,
    pub shutdown_timeout_secs: u64,
}

/// All control plane configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub model_ttl: Duration,
    pub slot_ttl: Duration,
    pub runner_ttl: Duration,
    pub strategy: SchedulingStrategy,
    pub queue_size: usize,
    pub decision_buffer_size: usize,
    pub decision_overflow: DecisionOverflow,
    pub model_eligibility: ModelEligibility,
    pub pull_wait: Duration,
    pub sweep_interval: Duration,
    pub default_model_memory: u64,
    /// Per-model request footprint.
    pub model_memory: HashMap<String, u64>,
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            model_ttl: Duration::from_secs(10),
            slot_ttl: Duration::from_secs(300),
            runner_ttl: Duration::from_secs(30),
            strategy: SchedulingStrategy::MaxSpread,
            queue_size: 100,
            decision_buffer_size: 10,
            decision_overflow: DecisionOverflow::DropOldest,
            model_eligibility: ModelEligibility::ResidentOrLoadable,
            pull_wait: Duration::from_millis(1000),
            sweep_interval: Duration::from_millis(1000),
            default_model_memory: 1,
            model_memory: HashMap::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// On-disk layout. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    model_ttl_secs: Option<u64>,
    slot_ttl_secs: Option<u64>,
    runner_ttl_secs: Option<u64>,
    strategy: Option<String>,
    queue_size: Option<usize>,
    decision_buffer_size: Option<usize>,
    decision_overflow: Option<DecisionOverflow>,
    model_eligibility: Option<ModelEligibility>,
    pull_wait_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    default_model_memory: Option<u64>,
    #[serde(default)]
    model_memory: HashMap<String, u64>,
    shutdown_timeout_secs: Option<u64>,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse any `FromStr` env var, returning `default` on missing or invalid.
fn parse_enum<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

fn secs(key: &str, current: Duration, floor: u64) -> Duration {
    Duration::from_secs(parse_u64(key, current.as_secs()).max(floor))
}

fn millis(key: &str, current: Duration, floor: u64) -> Duration {
    Duration::from_millis(parse_u64(key, current.as_millis() as u64).max(floor))
}

/// Load configuration from environment variables over the defaults.
///
/// Missing or invalid values fall back to defaults without panicking.
pub fn load() -> DispatchConfig {
    DispatchConfig::default().with_env()
}

impl DispatchConfig {
    /// Overlay `GG_DISPATCH_*` environment variables.
    pub fn with_env(self) -> Self {
        Self {
            model_ttl: secs("GG_DISPATCH_MODEL_TTL", self.model_ttl, 0),
            slot_ttl: secs("GG_DISPATCH_SLOT_TTL", self.slot_ttl, 1),
            runner_ttl: secs("GG_DISPATCH_RUNNER_TTL", self.runner_ttl, 1),
            strategy: parse_enum("GG_DISPATCH_STRATEGY", self.strategy),
            queue_size: parse_usize("GG_DISPATCH_QUEUE_SIZE", self.queue_size),
            decision_buffer_size: parse_usize("GG_DISPATCH_DECISION_BUFFER", self.decision_buffer_size),
            decision_overflow: parse_enum("GG_DISPATCH_DECISION_OVERFLOW", self.decision_overflow),
            model_eligibility: parse_enum("GG_DISPATCH_MODEL_ELIGIBILITY", self.model_eligibility),
            pull_wait: millis("GG_DISPATCH_PULL_WAIT_MS", self.pull_wait, 0),
            sweep_interval: millis("GG_DISPATCH_SWEEP_INTERVAL_MS", self.sweep_interval, MIN_SWEEP_INTERVAL_MS),
            default_model_memory: parse_u64("GG_DISPATCH_DEFAULT_MODEL_MEMORY", self.default_model_memory),
            model_memory: self.model_memory,
            shutdown_timeout: secs("GG_DISPATCH_SHUTDOWN_TIMEOUT", self.shutdown_timeout, 1),
        }
    }

    /// Parse TOML over the defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(input)?;
        let defaults = Self::default();
        let strategy = match file.strategy {
            Some(name) => name
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key: "strategy", value: name })?,
            None => defaults.strategy,
        };
        let or_secs = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_secs);
        let or_millis = |v: Option<u64>, d: Duration| v.map_or(d, Duration::from_millis);
        Ok(Self {
            model_ttl: or_secs(file.model_ttl_secs, defaults.model_ttl),
            slot_ttl: or_secs(file.slot_ttl_secs.map(|s| s.max(1)), defaults.slot_ttl),
            runner_ttl: or_secs(file.runner_ttl_secs.map(|s| s.max(1)), defaults.runner_ttl),
            strategy,
            queue_size: file.queue_size.unwrap_or(defaults.queue_size),
            decision_buffer_size: file.decision_buffer_size.unwrap_or(defaults.decision_buffer_size),
            decision_overflow: file.decision_overflow.unwrap_or(defaults.decision_overflow),
            model_eligibility: file.model_eligibility.unwrap_or(defaults.model_eligibility),
            pull_wait: or_millis(file.pull_wait_ms, defaults.pull_wait),
            sweep_interval: or_millis(
                file.sweep_interval_ms.map(|ms| ms.max(MIN_SWEEP_INTERVAL_MS)),
                defaults.sweep_interval,
            ),
            default_model_memory: file.default_model_memory.unwrap_or(defaults.default_model_memory),
            model_memory: file.model_memory,
            shutdown_timeout: or_secs(file.shutdown_timeout_secs.map(|s| s.max(1)), defaults.shutdown_timeout),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Memory a request for `model` occupies on a runner.
    pub fn model_footprint(&self, model: Option<&str>) -> u64 {
        model
            .and_then(|m| self.model_memory.get(m))
            .copied()
            .unwrap_or(self.default_model_memory)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            registry: RegistryConfig {
                runner_ttl: self.runner_ttl,
                model_ttl: self.model_ttl,
                eligibility: self.model_eligibility,
            },
            slot_ttl: self.slot_ttl,
            queue: PendingQueueConfig { capacity: self.queue_size },
            decision_buffer_size: self.decision_buffer_size,
            decision_overflow: self.decision_overflow,
            strategy: self.strategy,
            pull_wait: self.pull_wait,
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            model_ttl_secs: self.model_ttl.as_secs(),
            slot_ttl_secs: self.slot_ttl.as_secs(),
            runner_ttl_secs: self.runner_ttl.as_secs(),
            strategy: self.strategy.to_string(),
            queue_size: self.queue_size,
            decision_buffer_size: self.decision_buffer_size,
            decision_overflow: self.decision_overflow,
            model_eligibility: self.model_eligibility,
            pull_wait_ms: self.pull_wait.as_millis() as u64,
            sweep_interval_ms: self.sweep_interval.as_millis() as u64,
            default_model_memory: self.default_model_memory,
            model_memory_entries: self.model_memory.len(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
        }
    }
}
