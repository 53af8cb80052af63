//! Shared test helpers for `tideguard-core` integration tests.
//!
//! [`ScriptedExecutor`] replays a queue of canned replies (echoing payloads
//! once the script runs out) and records every batch it sees, so tests can
//! assert on exactly what reached the underlying operation.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tideguard_core::{
    BackoffPolicy, Batch, BatchExecutor, BatchPolicy, BatchResult, CircuitPolicy, ExecutorConfig,
    GroupPolicy, OperationError, Priority, RetryPolicy,
};
use tokio::sync::Notify;
use tokio::time::Instant;

/// What the executor does for one call
#[derive(Clone)]
pub enum Reply {
    /// `PerMember` with every payload echoed back
    Echo,
    All(Result<u32, OperationError>),
    PerMember(Vec<Result<u32, OperationError>>),
    Failed(OperationError),
    Panic,
    /// Wait for the notify, then echo
    Hold(Arc<Notify>),
}

/// One executor call as observed by the executor
#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub group_key: String,
    pub sequence: u64,
    pub ids: Vec<String>,
    pub payloads: Vec<u32>,
    pub attempts: Vec<u32>,
    pub priority: Priority,
    pub at: Instant,
}

#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<Reply>>,
    calls: Mutex<Vec<RecordedBatch>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scripted(replies: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        let executor = Self::default();
        executor.script.lock().extend(replies);
        Arc::new(executor)
    }

    /// Reply used once the script is exhausted (default: echo)
    pub fn always(reply: Reply) -> Arc<Self> {
        let executor = Self::default();
        *executor.fallback.lock() = Some(reply);
        Arc::new(executor)
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<RecordedBatch> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl BatchExecutor for ScriptedExecutor {
    type Payload = u32;
    type Output = u32;

    async fn invoke(&self, batch: &Batch<u32>) -> BatchResult<u32> {
        self.calls.lock().push(RecordedBatch {
            group_key: batch.group_key.clone(),
            sequence: batch.sequence,
            ids: batch.ids().map(|id| id.to_string()).collect(),
            payloads: batch.payloads().copied().collect(),
            attempts: batch.members.iter().map(|member| member.attempt).collect(),
            priority: batch.priority(),
            at: Instant::now(),
        });

        let reply = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or(Reply::Echo);

        match reply {
            Reply::Echo => echo(batch),
            Reply::All(outcome) => BatchResult::All(outcome),
            Reply::PerMember(outcomes) => BatchResult::PerMember(outcomes),
            Reply::Failed(err) => BatchResult::Failed(err),
            Reply::Panic => panic!("scripted executor panic"),
            Reply::Hold(notify) => {
                notify.notified().await;
                echo(batch)
            }
        }
    }
}

fn echo(batch: &Batch<u32>) -> BatchResult<u32> {
    BatchResult::PerMember(batch.payloads().map(|payload| Ok(*payload)).collect())
}

/// Deterministic defaults: no jitter, fixed seed
pub fn config(max_batch_size: usize, window: Duration) -> ExecutorConfig {
    ExecutorConfig {
        defaults: GroupPolicy {
            batch: BatchPolicy::new(max_batch_size, window),
            circuit: CircuitPolicy {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(10),
                probe_cooldown: None,
            },
            backoff: BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(1))
                .without_jitter(),
            retry: RetryPolicy { max_retries: 3 },
            gate: None,
        },
        jitter_seed: Some(42),
        ..ExecutorConfig::default()
    }
}

/// Unbatched: every submission is its own batch
pub fn unbatched() -> ExecutorConfig {
    config(1, Duration::from_secs(60))
}

pub fn transient(message: &str) -> OperationError {
    OperationError::transient(message)
}

pub fn permanent(message: &str) -> OperationError {
    OperationError::permanent(message)
}
