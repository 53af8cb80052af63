//! Circuit breaker
//!
//! Guards whether an operation may be attempted at all. State machine:
//!
//! ```text
//!            failures >= threshold             reset_timeout elapsed
//!   Closed ───────────────────────────► Open ──────────────────────► HalfOpen
//!     ▲                                   ▲        (next attempt)       │
//!     │          probe succeeded          │       probe failed          │
//!     └───────────────────────────────────┼─────────────────────────────┘
//!                                         └──── opened_at = now ────────┘
//! ```
//!
//! The Open → HalfOpen transition is lazy: it happens when an attempt is made
//! after the timeout, never on a timer. HalfOpen admits exactly one probe at a
//! time; everyone else fast-fails with [`CircuitOpenError`] until the probe
//! reports back.
//!
//! Two ways to use it:
//! - [`CircuitBreaker::execute`] / [`CircuitBreaker::call`] wrap a closure and
//!   record its `Result`.
//! - [`CircuitBreaker::try_acquire`] hands out a [`CircuitPermit`] for callers
//!   that decide success themselves (the batching queue does this).

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::{CommonError, CommonResult};
use crate::utils::serde::{duration_millis, option_duration_millis};

/// Default consecutive failures before opening
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time spent Open before a probe is allowed
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);

//==============================================================================
// Error Types
//==============================================================================

/// Synthetic fast-fail produced locally while the circuit refuses calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit '{circuit}' is open")]
pub struct CircuitOpenError {
    /// Name of the rejecting circuit
    pub circuit: String,
    /// Time until a probe may be attempted; `None` while a probe is in flight
    pub retry_after: Option<Duration>,
}

impl From<CircuitOpenError> for CommonError {
    fn from(err: CircuitOpenError) -> Self {
        match err.retry_after {
            Some(retry_after) => CommonError::circuit_breaker_with_retry(err.circuit, retry_after),
            None => CommonError::circuit_breaker(err.circuit),
        }
    }
}

/// Outcome of a guarded operation
///
/// Keeps the breaker's own rejection apart from the operation's error so
/// callers can react differently to each.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, the operation was not invoked
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether this is the breaker's fast-fail
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::CircuitOpen(_) => None,
        }
    }
}

/// Result type for guarded operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

//==============================================================================
// Configuration
//==============================================================================

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, a single probe tests recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (while Closed) that open the circuit
    pub failure_threshold: u32,
    /// Time to wait in Open before a probe is allowed
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    /// Wait used instead of `reset_timeout` after a failed probe
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub probe_cooldown: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            probe_cooldown: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> CommonResult<()> {
        if self.failure_threshold == 0 {
            return Err(CommonError::config_field(
                "failure_threshold",
                "failure_threshold must be greater than 0",
            ));
        }

        if self.reset_timeout.is_zero() {
            return Err(CommonError::config_field(
                "reset_timeout",
                "reset_timeout must be greater than 0",
            ));
        }

        if self.probe_cooldown.is_some_and(|cooldown| cooldown.is_zero()) {
            return Err(CommonError::config_field(
                "probe_cooldown",
                "probe_cooldown must be greater than 0 when set",
            ));
        }

        Ok(())
    }

    fn reopen_wait(&self) -> Duration {
        self.probe_cooldown.unwrap_or(self.reset_timeout)
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn probe_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.probe_cooldown = Some(cooldown);
        self
    }

    /// Set a custom clock and build a `CircuitBreaker` directly
    pub fn clock<C: Clock>(self, clock: C) -> CircuitBreakerBuilderWithClock<C> {
        CircuitBreakerBuilderWithClock { config: self.config, clock, name: None }
    }

    pub fn build(self) -> CommonResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder with custom clock that builds a CircuitBreaker directly
pub struct CircuitBreakerBuilderWithClock<C: Clock> {
    config: CircuitBreakerConfig,
    clock: C,
    name: Option<String>,
}

impl<C: Clock> CircuitBreakerBuilderWithClock<C> {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn probe_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.probe_cooldown = Some(cooldown);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn build(self) -> CommonResult<CircuitBreaker<C>> {
        let name = self.name.unwrap_or_else(|| DEFAULT_CIRCUIT_NAME.to_string());
        CircuitBreaker::named(name, self.config, self.clock)
    }
}

const DEFAULT_CIRCUIT_NAME: &str = "default";

//==============================================================================
// Breaker
//==============================================================================

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Only meaningful while Closed
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub opened_at: Option<Instant>,
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    /// How long the current Open period lasts
    open_for: Duration,
    probe_in_flight: bool,
    state_changed_at: Instant,
}

struct BreakerShared<C: Clock> {
    name: String,
    config: CircuitBreakerConfig,
    clock: C,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
}

impl<C: Clock> BreakerShared<C> {
    fn acquire(&self) -> Result<bool, CircuitOpenError> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let current = guard.state;

        let probe = match current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = guard.opened_at.unwrap_or(guard.state_changed_at);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < guard.open_for {
                    let retry_after = guard.open_for - elapsed;
                    drop(guard);
                    return Err(self.reject(Some(retry_after)));
                }

                guard.state = CircuitState::HalfOpen;
                guard.state_changed_at = now;
                guard.probe_in_flight = true;
                info!(circuit = %self.name, "Circuit breaker half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if guard.probe_in_flight {
                    drop(guard);
                    return Err(self.reject(None));
                }
                guard.probe_in_flight = true;
                true
            }
        };

        drop(guard);
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(probe)
    }

    fn reject(&self, retry_after: Option<Duration>) -> CircuitOpenError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        debug!(circuit = %self.name, ?retry_after, "Circuit breaker rejecting call");
        CircuitOpenError { circuit: self.name.clone(), retry_after }
    }

    fn on_success(&self, probe: bool) {
        self.success_count.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let current = guard.state;

        match current {
            CircuitState::Closed => guard.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                guard.state = CircuitState::Closed;
                guard.state_changed_at = now;
                guard.consecutive_failures = 0;
                guard.opened_at = None;
                guard.probe_in_flight = false;
                info!(circuit = %self.name, "Circuit breaker closed after successful probe");
            }
            // A call admitted while Closed finished after the circuit tripped
            _ => debug!(circuit = %self.name, state = %current, "Ignoring late success"),
        }
    }

    fn on_failure(&self, probe: bool) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let current = guard.state;

        match current {
            CircuitState::Closed => {
                guard.consecutive_failures = guard.consecutive_failures.saturating_add(1);
                if guard.consecutive_failures >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.state_changed_at = now;
                    guard.opened_at = Some(now);
                    guard.open_for = self.config.reset_timeout;
                    warn!(
                        circuit = %self.name,
                        failures = guard.consecutive_failures,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen if probe => {
                guard.state = CircuitState::Open;
                guard.state_changed_at = now;
                guard.opened_at = Some(now);
                guard.open_for = self.config.reopen_wait();
                guard.probe_in_flight = false;
                warn!(
                    circuit = %self.name,
                    wait_ms = guard.open_for.as_millis() as u64,
                    "Circuit breaker re-opened after failed probe"
                );
            }
            _ => debug!(circuit = %self.name, state = %current, "Ignoring late failure"),
        }
    }
}

/// Generic circuit breaker
///
/// Clones share state. Each breaker is independent of every other breaker;
/// there is no global registry here.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    shared: Arc<BreakerShared<C>>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.shared.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("state", &guard.state)
            .field("consecutive_failures", &guard.consecutive_failures)
            .finish()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> CommonResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a circuit breaker using the builder pattern
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        Self::from_parts(DEFAULT_CIRCUIT_NAME.to_string(), config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a circuit breaker with a custom clock
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> CommonResult<Self> {
        Self::named(DEFAULT_CIRCUIT_NAME, config, clock)
    }

    /// Create a named circuit breaker; the name shows up in logs and errors
    pub fn named(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: C,
    ) -> CommonResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(name.into(), config, clock))
    }

    fn from_parts(name: String, config: CircuitBreakerConfig, clock: C) -> Self {
        let now = clock.now();
        let state = BreakerState {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            open_for: config.reset_timeout,
            probe_in_flight: false,
            state_changed_at: now,
        };

        Self {
            shared: Arc::new(BreakerShared {
                name,
                config,
                clock,
                state: Mutex::new(state),
                total_calls: AtomicU64::new(0),
                rejected_calls: AtomicU64::new(0),
                success_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Ask for permission to run one operation
    ///
    /// Performs the lazy Open → HalfOpen transition. The returned permit must
    /// be settled with [`CircuitPermit::record_success`] or
    /// [`CircuitPermit::record_failure`]; a probe permit dropped unsettled is
    /// treated as a failed probe.
    pub fn try_acquire(&self) -> Result<CircuitPermit<C>, CircuitOpenError> {
        let probe = self.shared.acquire()?;
        Ok(CircuitPermit { shared: Arc::clone(&self.shared), probe, settled: false })
    }

    /// Execute an async operation with circuit breaker protection
    ///
    /// While Open (or while another probe is in flight) the operation is not
    /// invoked.
    #[instrument(skip(self, operation), fields(circuit = %self.shared.name, state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire().map_err(ResilienceError::CircuitOpen)?;

        match operation().await {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(error) => {
                permit.record_failure();
                debug!(error = %error, "Guarded operation failed");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(circuit = %self.shared.name, state = %self.state()))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.try_acquire().map_err(ResilienceError::CircuitOpen)?;

        match operation() {
            Ok(result) => {
                permit.record_success();
                Ok(result)
            }
            Err(error) => {
                permit.record_failure();
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Current stored state
    ///
    /// An Open circuit whose timeout has elapsed still reports `Open` until
    /// the next attempt performs the transition.
    pub fn state(&self) -> CircuitState {
        self.shared.state.lock().state
    }

    /// Time left before a probe may be attempted, `None` unless Open
    pub fn remaining_open_time(&self) -> Option<Duration> {
        let now = self.shared.clock.now();
        let guard = self.shared.state.lock();
        if guard.state != CircuitState::Open {
            return None;
        }
        let opened_at = guard.opened_at?;
        Some(guard.open_for.saturating_sub(now.saturating_duration_since(opened_at)))
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let guard = self.shared.state.lock();
        CircuitBreakerMetrics {
            state: guard.state,
            consecutive_failures: guard.consecutive_failures,
            total_calls: self.shared.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.shared.rejected_calls.load(Ordering::Relaxed),
            success_count: self.shared.success_count.load(Ordering::Relaxed),
            failure_count: self.shared.failure_count.load(Ordering::Relaxed),
            opened_at: guard.opened_at,
            state_changed_at: guard.state_changed_at,
        }
    }

    /// Reset the circuit breaker to closed state
    ///
    /// An outstanding probe permit settles against the fresh Closed state.
    pub fn reset(&self) {
        let now = self.shared.clock.now();
        let mut guard = self.shared.state.lock();
        guard.state = CircuitState::Closed;
        guard.consecutive_failures = 0;
        guard.opened_at = None;
        guard.open_for = self.shared.config.reset_timeout;
        guard.probe_in_flight = false;
        guard.state_changed_at = now;
        info!(circuit = %self.shared.name, "Circuit breaker manually reset to closed state");
    }
}

/// Permission to run a single operation through a [`CircuitBreaker`]
///
/// Owned, so it can be moved into a spawned task across await points.
#[must_use = "an unsettled probe permit counts as a failed probe"]
pub struct CircuitPermit<C: Clock = SystemClock> {
    shared: Arc<BreakerShared<C>>,
    probe: bool,
    settled: bool,
}

impl<C: Clock> CircuitPermit<C> {
    /// Whether this permit is the HalfOpen probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.shared.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.settled = true;
        self.shared.on_failure(self.probe);
    }
}

impl<C: Clock> fmt::Debug for CircuitPermit<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitPermit")
            .field("circuit", &self.shared.name)
            .field("probe", &self.probe)
            .finish()
    }
}

impl<C: Clock> Drop for CircuitPermit<C> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            warn!(circuit = %self.shared.name, "Probe permit dropped without a result");
            self.shared.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the circuit breaker
    //!
    //! State transitions are driven by `MockClock`, so no test sleeps.

    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;

    use super::*;
    use crate::resilience::clock::MockClock;

    #[derive(Debug, Error)]
    #[error("backend unavailable")]
    struct Unavailable;

    fn breaker(threshold: u32, reset_secs: u64) -> (CircuitBreaker<MockClock>, MockClock) {
        let clock = MockClock::new();
        let cb = CircuitBreakerConfig::builder()
            .failure_threshold(threshold)
            .reset_timeout(Duration::from_secs(reset_secs))
            .clock(clock.clone())
            .name("test")
            .build()
            .expect("valid config");
        (cb, clock)
    }

    fn fail(cb: &CircuitBreaker<MockClock>) {
        let result: ResilienceResult<(), Unavailable> = cb.call(|| Err(Unavailable));
        assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Validates `CircuitState` display strings.
    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    /// Default configuration is valid and has no probe cooldown.
    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
        assert_eq!(config.reset_timeout, DEFAULT_RESET_TIMEOUT);
        assert_eq!(config.probe_cooldown, None);
        assert!(config.validate().is_ok());
    }

    /// Zero thresholds and timeouts are rejected.
    ///
    /// Assertions:
    /// - Each invalid builder returns `CommonError::Config` naming the field.
    #[test]
    fn test_circuit_breaker_config_validation() {
        let err = CircuitBreakerConfig::builder().failure_threshold(0).build().unwrap_err();
        assert!(matches!(err, CommonError::Config { field: Some(ref f), .. } if f == "failure_threshold"));

        let err = CircuitBreakerConfig::builder().reset_timeout(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, CommonError::Config { field: Some(ref f), .. } if f == "reset_timeout"));

        let err = CircuitBreakerConfig::builder().probe_cooldown(Duration::ZERO).build().unwrap_err();
        assert!(matches!(err, CommonError::Config { field: Some(ref f), .. } if f == "probe_cooldown"));
    }

    /// Configuration reads from TOML with millisecond durations.
    #[test]
    fn test_circuit_breaker_config_from_toml() {
        let config: CircuitBreakerConfig =
            toml::from_str("failure_threshold = 3\nreset_timeout = 10000\n").expect("valid toml");

        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.reset_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_cooldown, None);
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// With `failure_threshold = 3`, three failures open the circuit and the
    /// fourth call fast-fails without invoking the operation.
    ///
    /// Assertions:
    /// - The operation ran exactly 3 times.
    /// - The fourth result is `ResilienceError::CircuitOpen`.
    #[test]
    fn test_circuit_trips_after_threshold() {
        let (cb, _clock) = breaker(3, 10);
        let invocations = AtomicU32::new(0);

        for _ in 0..3 {
            let result: ResilienceResult<(), Unavailable> = cb.call(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(Unavailable)
            });
            assert!(result.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result: ResilienceResult<(), Unavailable> = cb.call(|| {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(matches!(result, Err(ResilienceError::CircuitOpen(_))));
        assert_eq!(invocations.load(Ordering::SeqCst), 3, "open circuit must not invoke");
        assert_eq!(cb.metrics().rejected_calls, 1);
    }

    /// A success while Closed resets the consecutive failure count.
    #[test]
    fn test_success_resets_consecutive_failures() {
        let (cb, _clock) = breaker(3, 10);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.metrics().consecutive_failures, 2);

        let ok: ResilienceResult<u8, Unavailable> = cb.call(|| Ok(1));
        assert_eq!(ok.ok(), Some(1));
        assert_eq!(cb.metrics().consecutive_failures, 0);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed, "count restarted after success");
    }

    /// Open circuit with `reset_timeout = 10s`: rejected at 9s, probe admitted
    /// at 11s, a successful probe closes it.
    ///
    /// Assertions:
    /// - 9s: `CircuitOpen` with roughly 1s `retry_after`.
    /// - 11s: permit is a probe and state is `HalfOpen`.
    /// - After success: `Closed` and `consecutive_failures == 0`.
    #[test]
    fn test_circuit_recovers_after_reset_timeout() {
        let (cb, clock) = breaker(3, 10);
        for _ in 0..3 {
            fail(&cb);
        }

        clock.advance(Duration::from_secs(9));
        let rejected = cb.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Some(Duration::from_secs(1)));
        assert_eq!(rejected.circuit, "test");

        clock.advance(Duration::from_secs(2));
        let permit = cb.try_acquire().expect("probe should be admitted");
        assert!(permit.is_probe());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        permit.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 0);

        let next = cb.try_acquire().expect("closed circuit admits calls");
        assert!(!next.is_probe());
        next.record_success();
    }

    /// HalfOpen admits exactly one probe; other callers fast-fail until it
    /// reports back.
    #[test]
    fn test_half_open_admits_single_probe() {
        let (cb, clock) = breaker(1, 5);
        fail(&cb);
        clock.advance(Duration::from_secs(5));

        let probe = cb.try_acquire().expect("first caller probes");
        let second = cb.try_acquire().unwrap_err();
        assert_eq!(second.retry_after, None, "no ETA while a probe is in flight");

        let invoked = AtomicU32::new(0);
        let third: ResilienceResult<(), Unavailable> = cb.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(third.unwrap_err().is_circuit_open());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        probe.record_success();
        assert!(cb.try_acquire().is_ok());
    }

    /// A failed probe re-opens the circuit and restarts the full timeout.
    #[test]
    fn test_failed_probe_resets_opened_at() {
        let (cb, clock) = breaker(1, 10);
        fail(&cb);

        clock.advance(Duration::from_secs(11));
        cb.try_acquire().expect("probe admitted").record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(9));
        assert!(cb.try_acquire().is_err(), "timeout restarted at probe failure");

        clock.advance(Duration::from_secs(2));
        assert!(cb.try_acquire().expect("second probe").is_probe());
    }

    /// With `probe_cooldown` configured, the wait after a failed probe is the
    /// cooldown instead of `reset_timeout`.
    #[test]
    fn test_probe_cooldown_after_failed_probe() {
        let clock = MockClock::new();
        let cb = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(30))
            .probe_cooldown(Duration::from_secs(2))
            .clock(clock.clone())
            .build()
            .expect("valid config");

        fail(&cb);
        clock.advance(Duration::from_secs(29));
        assert!(cb.try_acquire().is_err(), "initial open period uses reset_timeout");

        clock.advance(Duration::from_secs(1));
        cb.try_acquire().expect("probe").record_failure();
        assert_eq!(cb.remaining_open_time(), Some(Duration::from_secs(2)));

        clock.advance(Duration::from_secs(2));
        assert!(cb.try_acquire().is_ok());
    }

    /// Dropping a probe permit without a result counts as a failed probe.
    #[test]
    fn test_dropped_probe_permit_reopens() {
        let (cb, clock) = breaker(1, 1);
        fail(&cb);
        clock.advance(Duration::from_secs(1));

        drop(cb.try_acquire().expect("probe"));

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    /// A call admitted while Closed that succeeds after the circuit tripped
    /// does not close it.
    #[test]
    fn test_late_success_does_not_close_open_circuit() {
        let (cb, _clock) = breaker(2, 10);

        let straggler = cb.try_acquire().expect("closed");
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        straggler.record_success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    /// Two breakers never share state.
    #[test]
    fn test_breakers_are_independent() {
        let (a, _clock_a) = breaker(1, 10);
        let (b, _clock_b) = breaker(1, 10);

        fail(&a);

        assert_eq!(a.state(), CircuitState::Open);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    /// Clones observe the same state.
    #[test]
    fn test_clone_shares_state() {
        let (cb, _clock) = breaker(1, 10);
        let clone = cb.clone();

        fail(&clone);

        assert_eq!(cb.state(), CircuitState::Open);
    }

    /// `reset()` closes the circuit and clears the counter.
    #[test]
    fn test_reset() {
        let (cb, _clock) = breaker(1, 10);
        fail(&cb);
        assert!(cb.remaining_open_time().is_some());

        cb.reset();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.remaining_open_time(), None);
        assert!(cb.try_acquire().is_ok());
    }

    /// Metrics count admitted, rejected and settled calls.
    #[test]
    fn test_metrics_snapshot() {
        let (cb, _clock) = breaker(2, 10);

        let _: ResilienceResult<(), Unavailable> = cb.call(|| Ok(()));
        fail(&cb);
        fail(&cb);
        let _ = cb.try_acquire();

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_calls, 3);
        assert_eq!(metrics.rejected_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 2);
        assert!(metrics.opened_at.is_some());
    }

    /// Rejections convert into `CommonError::CircuitBreakerOpen`.
    #[test]
    fn test_circuit_open_error_into_common() {
        let err = CircuitOpenError { circuit: "billing".into(), retry_after: Some(Duration::from_secs(3)) };
        let common: CommonError = err.into();
        assert!(matches!(
            common,
            CommonError::CircuitBreakerOpen { ref service, retry_after: Some(_) } if service == "billing"
        ));
    }

    // =========================================================================
    // Async and concurrent use
    // =========================================================================

    /// `execute` runs the future and records its outcome.
    #[tokio::test]
    async fn test_execute_success_and_failure() {
        let (cb, _clock) = breaker(1, 10);

        let ok: ResilienceResult<&str, Unavailable> = cb.execute(|| async { Ok("done") }).await;
        assert_eq!(ok.ok(), Some("done"));

        let err: ResilienceResult<(), Unavailable> = cb.execute(|| async { Err(Unavailable) }).await;
        assert!(matches!(err, Err(ResilienceError::OperationFailed { .. })));
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected: ResilienceResult<(), Unavailable> = cb.execute(|| async { Ok(()) }).await;
        assert!(rejected.unwrap_err().is_circuit_open());
    }

    /// Many threads racing for the HalfOpen slot get exactly one probe.
    #[test]
    fn test_concurrent_half_open_single_probe() {
        let (cb, clock) = breaker(1, 1);
        fail(&cb);
        clock.advance(Duration::from_secs(1));

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cb = cb.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cb.try_acquire().ok()
                })
            })
            .collect();

        // Permits are held until every thread has joined.
        let permits: Vec<_> = handles.into_iter().filter_map(|h| h.join().ok().flatten()).collect();
        assert_eq!(permits.len(), 1);
        assert!(permits[0].is_probe());
    }
}
