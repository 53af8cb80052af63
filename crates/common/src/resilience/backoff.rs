//! Backoff delay calculation
//!
//! [`BackoffPolicy::compute_delay`] is a pure function of the attempt number,
//! the policy, and the random source handed to it. Production callers pass
//! `rand::thread_rng()`; tests pass a seeded `StdRng` to get reproducible
//! jitter.
//!
//! Exponential (default):
//!
//! ```text
//! raw    = min(base_delay * 2^attempt, max_delay)
//! jitter = raw * jitter_factor * U[0, 1)
//! delay  = raw + jitter           (<= max_delay * (1 + jitter_factor))
//! ```
//!
//! Linear uses `base_delay * (attempt + 1)` with the same cap. Fixed always
//! returns `base_delay` and has jitter disabled unless configured.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};
use crate::utils::serde::duration_millis;

/// Default base delay for backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default jitter factor (0.0 = no jitter, 1.0 = up to double the delay)
pub const DEFAULT_JITTER_FACTOR: f64 = 0.3;

/// Maximum exponent for exponential backoff calculation to prevent overflow
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Shape of the delay curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay * 2^attempt`
    #[default]
    Exponential,
    /// `base_delay * (attempt + 1)`
    Linear,
    /// `base_delay` for every attempt
    Fixed,
}

/// Backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay curve
    pub strategy: BackoffStrategy,
    /// Delay for attempt 0
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    /// Cap applied before jitter
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    /// Fraction of the raw delay that may be added as random jitter
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl BackoffPolicy {
    /// Exponential backoff with the default jitter factor
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }

    /// Linear backoff with the default jitter factor
    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self { strategy: BackoffStrategy::Linear, base_delay, max_delay, jitter_factor: DEFAULT_JITTER_FACTOR }
    }

    /// Fixed interval, jitter off
    pub fn fixed(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: interval,
            max_delay: interval,
            jitter_factor: 0.0,
        }
    }

    /// Set the jitter factor
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Disable jitter
    pub fn without_jitter(self) -> Self {
        self.with_jitter_factor(0.0)
    }

    /// Validate the policy
    ///
    /// Requires `base_delay > 0`, `max_delay >= base_delay`, and a jitter
    /// factor in `[0.0, 1.0]`.
    pub fn validate(&self) -> CommonResult<()> {
        if self.base_delay.is_zero() {
            return Err(CommonError::config_field("base_delay", "must be greater than 0"));
        }

        if self.max_delay < self.base_delay {
            return Err(CommonError::config_field(
                "max_delay",
                format!(
                    "max_delay ({:?}) cannot be less than base_delay ({:?})",
                    self.max_delay, self.base_delay
                ),
            ));
        }

        if !self.jitter_factor.is_finite() || !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CommonError::config_field(
                "jitter_factor",
                format!("must be within [0.0, 1.0], got {}", self.jitter_factor),
            ));
        }

        Ok(())
    }

    /// Delay before jitter for the given 0-based attempt
    pub fn compute_delay_without_jitter(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Exponential => {
                let exponent = attempt.min(MAX_BACKOFF_EXPONENT);
                self.base_delay.saturating_mul(1_u32 << exponent).min(self.max_delay)
            }
            BackoffStrategy::Linear => {
                self.base_delay.saturating_mul(attempt.saturating_add(1)).min(self.max_delay)
            }
            BackoffStrategy::Fixed => self.base_delay,
        }
    }

    /// Delay for the given 0-based attempt, jitter drawn from `rng`
    pub fn compute_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let raw = self.compute_delay_without_jitter(attempt);
        let factor = self.effective_jitter_factor();
        if factor == 0.0 {
            return raw;
        }

        let sample: f64 = rng.gen();
        let jitter =
            Duration::try_from_secs_f64(raw.as_secs_f64() * factor * sample).unwrap_or_default();
        raw.saturating_add(jitter)
    }

    /// Largest delay this policy can produce
    pub fn max_possible_delay(&self) -> Duration {
        let cap = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            _ => self.max_delay,
        };
        let factor = self.effective_jitter_factor();
        cap.saturating_add(Duration::try_from_secs_f64(cap.as_secs_f64() * factor).unwrap_or_default())
    }

    fn effective_jitter_factor(&self) -> f64 {
        if self.jitter_factor.is_finite() && self.jitter_factor > 0.0 {
            self.jitter_factor.min(1.0)
        } else {
            0.0
        }
    }
}

/// Free-function form of [`BackoffPolicy::compute_delay`]
pub fn compute_delay<R: Rng + ?Sized>(attempt: u32, policy: &BackoffPolicy, rng: &mut R) -> Duration {
    policy.compute_delay(attempt, rng)
}
