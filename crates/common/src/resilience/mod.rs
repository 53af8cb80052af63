//! Resilience primitives
//!
//! - **Backoff** ([`backoff`]): pure delay calculation for retries, with
//!   exponential, linear and fixed curves plus bounded jitter
//! - **Clock** ([`clock`]): time source abstraction shared by everything
//!   time-dependent
//! - **Circuit Breaker** ([`circuit_breaker`]): per-target state machine that
//!   fast-fails while a dependency is known to be down
//!
//! These are generic over the caller's error type and hold no global state.
//! The request-level machinery (batching, coalescing, gates) lives in
//! `tideguard-core` and is built on top of them.

pub mod backoff;
#[cfg(feature = "runtime")]
pub mod circuit_breaker;
#[cfg(feature = "runtime")]
pub mod clock;

pub use backoff::{compute_delay, BackoffPolicy, BackoffStrategy};
#[cfg(feature = "runtime")]
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilderWithClock, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitOpenError, CircuitPermit,
    CircuitState, ResilienceError, ResilienceResult,
};
#[cfg(feature = "runtime")]
pub use clock::{Clock, MockClock, SystemClock, TokioClock};
