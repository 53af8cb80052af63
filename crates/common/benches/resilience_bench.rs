//! Resilience benchmarks
//!
//! Backoff calculation and the circuit breaker's admission path, which sits
//! on every batch dispatch.
//!
//! Run with: `cargo bench --bench resilience_bench -p tideguard-common`

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tideguard_common::resilience::{
    BackoffPolicy, CircuitBreaker, CircuitBreakerConfig, MockClock, ResilienceError,
};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff_compute_delay");
    let policies = [
        ("exponential", BackoffPolicy::default()),
        ("linear", BackoffPolicy::linear(Duration::from_millis(10), Duration::from_secs(5))),
        ("fixed", BackoffPolicy::fixed(Duration::from_millis(10))),
    ];

    for (name, policy) in policies {
        group.bench_with_input(BenchmarkId::from_parameter(name), &policy, |b, policy| {
            let mut rng = StdRng::seed_from_u64(42);
            let mut attempt = 0u32;
            b.iter(|| {
                attempt = (attempt + 1) % 32;
                black_box(policy.compute_delay(black_box(attempt), &mut rng))
            });
        });
    }

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");

    group.bench_function("call_success", |b| {
        let breaker = CircuitBreaker::default();
        b.iter(|| {
            let result: Result<_, ResilienceError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            black_box(result.is_ok())
        });
    });

    group.bench_function("reject_while_open", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(3600))
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::with_clock(config, MockClock::new())
            .expect("circuit breaker should build with benchmark configuration");
        let _: Result<(), _> = breaker.call(|| Err(std::io::Error::other("benchmark failure")));

        b.iter(|| black_box(breaker.try_acquire().is_err()));
    });

    group.finish();
}

criterion_group!(benches, bench_backoff, bench_circuit_breaker);
criterion_main!(benches);
