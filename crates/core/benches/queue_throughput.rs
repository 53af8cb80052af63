//! Batching queue throughput
//!
//! Submit-to-resolve cost of a burst through the queue, unbatched versus
//! batched, plus the coalescing fast path.
//!
//! Run with: `cargo bench --bench queue_throughput -p tideguard-core`

use std::time::Duration;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tideguard_core::{
    Batch, BatchExecutor, BatchPolicy, BatchResult, ExecutorConfig, OperationRequest,
    ResilientExecutor,
};

struct Doubler;

#[async_trait]
impl BatchExecutor for Doubler {
    type Payload = u64;
    type Output = u64;

    async fn invoke(&self, batch: &Batch<u64>) -> BatchResult<u64> {
        BatchResult::PerMember(batch.payloads().map(|n| Ok(n * 2)).collect())
    }
}

fn executor(max_batch_size: usize) -> ResilientExecutor<Doubler> {
    let mut config = ExecutorConfig::default();
    config.defaults.batch = BatchPolicy::new(max_batch_size, Duration::from_millis(1));
    ResilientExecutor::new(Doubler, config).expect("valid config")
}

fn burst_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("queue_burst");
    group.sample_size(20).measurement_time(Duration::from_secs(10));

    for batch_size in [1usize, 16, 64] {
        let rre = {
            let _guard = runtime.enter();
            executor(batch_size)
        };

        group.bench_with_input(BenchmarkId::new("max_batch_size", batch_size), &rre, |b, rre| {
            b.iter(|| {
                runtime.block_on(async {
                    let completions: Vec<_> =
                        (0..256u64).map(|n| rre.submit(OperationRequest::new("bench", n))).collect();
                    black_box(futures::future::join_all(completions).await)
                })
            });
        });
    }

    group.finish();
}

fn coalesce_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let rre = {
        let _guard = runtime.enter();
        executor(64)
    };

    c.bench_function("coalesce_same_id", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let completions: Vec<_> = (0..64u64)
                    .map(|n| rre.submit(OperationRequest::new("bench", n).with_id("hot-key")))
                    .collect();
                black_box(futures::future::join_all(completions).await)
            })
        });
    });
}

criterion_group!(queue_benchmarks, burst_benchmark, coalesce_benchmark);
criterion_main!(queue_benchmarks);
