//! Executor configuration
//!
//! Every policy is plain serde data with millisecond durations, so the same
//! structs load from TOML, JSON or environment variables ([`loader`]) and can
//! be changed at runtime through [`PolicyUpdate`].
//!
//! ```toml
//! jitter_seed = 7
//!
//! [defaults.batch]
//! max_batch_size = 20
//! max_batch_window = 25
//!
//! [defaults.circuit]
//! failure_threshold = 3
//! reset_timeout = 10000
//!
//! [groups.search.gate]
//! mode = "debounce"
//! debounce_delay = 300
//!
//! [logging]
//! level = "debug"
//! json = true
//! ```

pub mod loader;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tideguard_common::duration_millis;
use tideguard_common::error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
use tideguard_common::{impl_error_classification, impl_error_conversion};

pub use tideguard_common::resilience::{BackoffPolicy, BackoffStrategy, CircuitBreakerConfig};

/// Circuit breaker settings for one group
pub type CircuitPolicy = CircuitBreakerConfig;

/// Default members per batch
pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;

/// Default time an open batch waits for more members
pub const DEFAULT_MAX_BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Default retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration errors, surfaced synchronously to the caller
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Common(#[from] CommonError),

    /// No `TIDEGUARD_*` variable is set
    #[error("no TIDEGUARD_* environment variables set")]
    EnvNotSet,

    #[error("invalid value for {var}: '{value}' ({reason})")]
    InvalidEnv { var: String, value: String, reason: String },

    #[error("no configuration file found (searched {searched:?})")]
    NotFound { searched: Vec<PathBuf> },

    #[error("unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Something that needs a tokio runtime was created outside one
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl_error_conversion!(ConfigError, Common);

impl_error_classification!(
    ConfigError,
    Common,
    ConfigError::EnvNotSet => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    ConfigError::InvalidEnv { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    ConfigError::NotFound { .. } => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    ConfigError::UnsupportedFormat(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    ConfigError::NoRuntime(_) => {
        retryable: false,
        severity: ErrorSeverity::Critical,
        critical: true,
    },
);

/// Size and time triggers for a group's batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Flush as soon as a batch holds this many members
    pub max_batch_size: usize,
    /// Flush this long after a batch's first member was admitted
    #[serde(with = "duration_millis")]
    pub max_batch_window: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self { max_batch_size: DEFAULT_MAX_BATCH_SIZE, max_batch_window: DEFAULT_MAX_BATCH_WINDOW }
    }
}

impl BatchPolicy {
    pub fn new(max_batch_size: usize, max_batch_window: Duration) -> Self {
        Self { max_batch_size, max_batch_window }
    }

    pub fn validate(&self) -> CommonResult<()> {
        if self.max_batch_size == 0 {
            return Err(CommonError::config_field("max_batch_size", "must be greater than 0"));
        }
        if self.max_batch_window.is_zero() {
            return Err(CommonError::config_field("max_batch_window", "must be greater than 0"));
        }
        Ok(())
    }
}

/// Retry budget for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    ///
    /// Once they are used up a transient failure resolves with
    /// `ExecutionError::MaxRetriesExceeded`. With 0, retrying is disabled and
    /// the failure resolves with `ExecutionError::Transient` instead.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// Which throttle edge emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleEdge {
    /// First event of each interval emits immediately; the rest are dropped
    #[default]
    Leading,
    /// Latest event of each interval emits at the interval boundary
    Trailing,
}

/// Rate-reduction gate in front of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum GatePolicy {
    /// Emit the last event after `debounce_delay` of silence
    Debounce {
        #[serde(with = "duration_millis")]
        debounce_delay: Duration,
    },
    /// Emit at most one event per `throttle_interval`
    Throttle {
        #[serde(with = "duration_millis")]
        throttle_interval: Duration,
        #[serde(default)]
        edge: ThrottleEdge,
    },
}

impl GatePolicy {
    pub fn debounce(delay: Duration) -> Self {
        Self::Debounce { debounce_delay: delay }
    }

    pub fn throttle(interval: Duration, edge: ThrottleEdge) -> Self {
        Self::Throttle { throttle_interval: interval, edge }
    }

    pub fn validate(&self) -> CommonResult<()> {
        match self {
            Self::Debounce { debounce_delay } if debounce_delay.is_zero() => {
                Err(CommonError::config_field("debounce_delay", "must be greater than 0"))
            }
            Self::Throttle { throttle_interval, .. } if throttle_interval.is_zero() => {
                Err(CommonError::config_field("throttle_interval", "must be greater than 0"))
            }
            _ => Ok(()),
        }
    }
}

/// Every policy that applies to one group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupPolicy {
    pub batch: BatchPolicy,
    pub circuit: CircuitPolicy,
    pub backoff: BackoffPolicy,
    pub retry: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GatePolicy>,
}

impl GroupPolicy {
    pub fn validate(&self) -> CommonResult<()> {
        self.batch.validate()?;
        self.circuit.validate()?;
        self.backoff.validate()?;
        if let Some(gate) = &self.gate {
            gate.validate()?;
        }
        Ok(())
    }
}

/// Partial policy for one group; unset sections inherit the defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GatePolicy>,
}

impl GroupOverride {
    /// Overlay this override on `base`
    pub fn apply_to(&self, base: &GroupPolicy) -> GroupPolicy {
        GroupPolicy {
            batch: self.batch.clone().unwrap_or_else(|| base.batch.clone()),
            circuit: self.circuit.clone().unwrap_or_else(|| base.circuit.clone()),
            backoff: self.backoff.clone().unwrap_or_else(|| base.backoff.clone()),
            retry: self.retry.unwrap_or(base.retry),
            gate: self.gate.clone().or_else(|| base.gate.clone()),
        }
    }
}

/// Logging bootstrap settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `TIDEGUARD_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Policy for any group without an override
    pub defaults: GroupPolicy,
    /// Per-group overrides keyed by group key
    pub groups: BTreeMap<String, GroupOverride>,
    pub logging: LoggingConfig,
    /// Seed for backoff jitter; random when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
}

impl ExecutorConfig {
    /// Validate the defaults and every resolved group policy
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for (group_key, group) in &self.groups {
            group.apply_to(&self.defaults).validate().map_err(|err| match err {
                CommonError::Config { message, field } => CommonError::config_field(
                    format!("groups.{group_key}.{}", field.unwrap_or_default()),
                    message,
                ),
                other => other,
            })?;
        }
        Ok(())
    }

    /// Resolved policy for `group_key`
    pub fn policy_for(&self, group_key: &str) -> GroupPolicy {
        match self.groups.get(group_key) {
            Some(group) => group.apply_to(&self.defaults),
            None => self.defaults.clone(),
        }
    }

    /// Set or replace a group override
    pub fn with_group(mut self, group_key: impl Into<String>, group: GroupOverride) -> Self {
        self.groups.insert(group_key.into(), group);
        self
    }
}

/// Runtime change to one group's policy
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyUpdate {
    Batch(BatchPolicy),
    /// Replacing the circuit policy resets that group's circuit to Closed
    Circuit(CircuitPolicy),
    Backoff(BackoffPolicy),
    Retry { max_retries: u32 },
    Gate(GatePolicy),
}

impl PolicyUpdate {
    pub fn validate(&self) -> CommonResult<()> {
        match self {
            Self::Batch(batch) => batch.validate(),
            Self::Circuit(circuit) => circuit.validate(),
            Self::Backoff(backoff) => backoff.validate(),
            Self::Retry { .. } => Ok(()),
            Self::Gate(gate) => gate.validate(),
        }
    }

    pub fn apply(self, policy: &mut GroupPolicy) {
        match self {
            Self::Batch(batch) => policy.batch = batch,
            Self::Circuit(circuit) => policy.circuit = circuit,
            Self::Backoff(backoff) => policy.backoff = backoff,
            Self::Retry { max_retries } => policy.retry = RetryPolicy { max_retries },
            Self::Gate(gate) => policy.gate = Some(gate),
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Circuit(_) => "circuit",
            Self::Backoff(_) => "backoff",
            Self::Retry { .. } => "retry",
            Self::Gate(_) => "gate",
        }
    }
}
