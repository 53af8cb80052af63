//! Integration tests for the resilience module
//!
//! Exercises backoff schedules and circuit breaker recovery the way the
//! request layer drives them: breaker permits held across awaits, backoff
//! delays slept on tokio's paused clock.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tideguard_common::resilience::{
    BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, CircuitState, MockClock, ResilienceError,
    TokioClock,
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
struct TestError {
    message: String,
}

fn transient() -> TestError {
    TestError { message: "Transient failure".to_string() }
}

/// A retry loop built from `compute_delay` and a circuit breaker recovers
/// from a short outage without tripping the breaker.
///
/// # Test Steps
/// 1. Operation fails twice, then succeeds
/// 2. Each failure sleeps the exponential delay for its attempt
/// 3. Breaker threshold (3) is never reached
#[tokio::test(start_paused = true)]
async fn test_retry_loop_with_backoff_and_breaker() {
    let breaker = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .reset_timeout(Duration::from_secs(10))
        .clock(TokioClock)
        .name("search")
        .build()
        .expect("valid config");
    let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(2))
        .without_jitter();
    let attempts = Arc::new(AtomicU32::new(0));
    let mut rng = StdRng::seed_from_u64(7);
    let started = tokio::time::Instant::now();

    let mut attempt = 0;
    let value = loop {
        let counter = Arc::clone(&attempts);
        let result = breaker
            .execute(|| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("results")
                }
            })
            .await;

        match result {
            Ok(value) => break value,
            Err(ResilienceError::OperationFailed { .. }) => {
                tokio::time::sleep(policy.compute_delay(attempt, &mut rng)).await;
                attempt += 1;
            }
            Err(ResilienceError::CircuitOpen(err)) => panic!("breaker tripped: {err}"),
        }
    };

    assert_eq!(value, "results");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(breaker.state(), CircuitState::Closed);
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(300), "100ms + 200ms of backoff, got {waited:?}");
    assert!(waited < Duration::from_millis(350));
}

/// A permit can be held across an await inside a spawned task; other callers
/// fast-fail while the probe is in flight.
#[tokio::test(start_paused = true)]
async fn test_probe_permit_across_await() {
    let breaker = CircuitBreakerConfig::builder()
        .failure_threshold(1)
        .reset_timeout(Duration::from_secs(1))
        .clock(TokioClock)
        .build()
        .expect("valid config");

    let _: Result<(), _> = breaker.call(|| Err(transient()));
    tokio::time::advance(Duration::from_secs(1)).await;

    let permit = breaker.try_acquire().expect("probe admitted");
    let probe = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        permit.record_success();
    });

    tokio::task::yield_now().await;
    assert!(breaker.try_acquire().is_err(), "second caller must not probe");

    tokio::time::timeout(Duration::from_secs(1), probe).await.expect("probe finished").expect("no panic");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Full open → half-open → open → half-open → closed cycle on a mock clock.
#[test]
fn test_breaker_full_recovery_cycle() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .reset_timeout(Duration::from_secs(10))
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, clock.clone()).expect("breaker");
    let calls = AtomicU32::new(0);

    let fail = || {
        let _: Result<(), _> = breaker.call(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        });
    };

    fail();
    fail();
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(10));
    fail();
    assert_eq!(breaker.state(), CircuitState::Open, "failed probe re-opens");

    clock.advance(Duration::from_secs(5));
    fail();
    assert_eq!(calls.load(Ordering::SeqCst), 3, "rejected call never ran");

    clock.advance(Duration::from_secs(5));
    let ok: Result<u8, ResilienceError<TestError>> = breaker.call(|| Ok(7));
    assert_eq!(ok.ok(), Some(7));

    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.consecutive_failures, 0);
    assert_eq!(metrics.rejected_calls, 1);
}

/// Seeded jitter stays inside its documented bounds for every strategy.
#[test]
fn test_backoff_jitter_bounds_across_strategies() {
    let policies = [
        BackoffPolicy::exponential(Duration::from_millis(50), Duration::from_secs(1)),
        BackoffPolicy::linear(Duration::from_millis(50), Duration::from_secs(1)),
        BackoffPolicy::fixed(Duration::from_millis(50)).with_jitter_factor(0.2),
    ];
    let mut rng = StdRng::seed_from_u64(2024);

    for policy in &policies {
        policy.validate().expect("valid policy");
        for attempt in 0..40 {
            let delay = policy.compute_delay(attempt, &mut rng);
            assert!(delay >= policy.compute_delay_without_jitter(attempt));
            assert!(delay <= policy.max_possible_delay());
        }
    }
}
