//! Caller-facing façade over the queue and registries

use std::sync::Arc;

use tideguard_common::{CircuitBreakerMetrics, CircuitState, CommonError};
use tokio::sync::mpsc;
use tracing::info;

use crate::batch::{BatchExecutor, BatchingQueue, Completion, QueueStats};
use crate::config::{ConfigError, ExecutorConfig, GroupPolicy, PolicyUpdate};
use crate::gate::Gate;
use crate::registry::{CircuitRegistry, PolicyRegistry};
use crate::request::{OperationRequest, RequestId};

/// Resilient request executor
///
/// Submissions are batched per `group_key`, coalesced by id, guarded by a
/// per-group circuit breaker and retried with backoff on transient failures.
///
/// ```no_run
/// # use std::time::Duration;
/// # use async_trait::async_trait;
/// # use tideguard_core::*;
/// struct Lookup;
///
/// #[async_trait]
/// impl BatchExecutor for Lookup {
///     type Payload = u64;
///     type Output = String;
///
///     async fn invoke(&self, batch: &Batch<u64>) -> BatchResult<String> {
///         BatchResult::PerMember(batch.payloads().map(|id| Ok(format!("user-{id}"))).collect())
///     }
/// }
///
/// # async fn run() -> Result<(), ConfigError> {
/// let executor = ResilientExecutor::new(Lookup, ExecutorConfig::default())?;
/// let name = executor.submit(OperationRequest::new("users", 7)).await;
/// assert_eq!(name.ok().as_deref(), Some("user-7"));
/// executor.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ResilientExecutor<E: BatchExecutor> {
    queue: BatchingQueue<E>,
    policies: Arc<PolicyRegistry>,
    circuits: Arc<CircuitRegistry>,
}

impl<E: BatchExecutor> ResilientExecutor<E> {
    /// # Errors
    /// Invalid configuration, or no tokio runtime.
    pub fn new(executor: E, config: ExecutorConfig) -> Result<Self, ConfigError> {
        Self::with_shared(Arc::new(executor), config)
    }

    /// Like [`Self::new`] for an executor the caller keeps a handle to
    pub fn with_shared(executor: Arc<E>, config: ExecutorConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let policies = Arc::new(PolicyRegistry::from_config(&config));
        let circuits = Arc::new(CircuitRegistry::new());
        let queue = BatchingQueue::new(
            executor,
            Arc::clone(&policies),
            Arc::clone(&circuits),
            config.jitter_seed,
        )?;

        info!(groups = config.groups.len(), "resilient executor started");
        Ok(Self { queue, policies, circuits })
    }

    /// Submit a request; the returned `Completion` resolves with its outcome
    pub fn submit(&self, request: OperationRequest<E::Payload>) -> Completion<E::Output> {
        self.queue.submit(request)
    }

    /// Cancel an in-flight request; false if it already resolved
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.queue.cancel(id)
    }

    /// Change one group's policy at runtime
    ///
    /// Batch, backoff and retry changes apply to batches formed afterwards.
    /// A circuit change replaces the group's breaker, which resets it to
    /// Closed.
    ///
    /// # Errors
    /// The update fails validation; nothing is changed.
    pub fn configure(&self, group_key: &str, update: PolicyUpdate) -> Result<(), ConfigError> {
        update.validate()?;

        if let PolicyUpdate::Circuit(circuit) = &update {
            self.circuits.replace(group_key, circuit)?;
        }

        info!(group_key, section = update.kind(), "group policy updated");
        self.policies.apply(group_key, update);
        Ok(())
    }

    pub fn policy(&self, group_key: &str) -> GroupPolicy {
        self.policies.policy_for(group_key)
    }

    /// `Closed` for groups that have not executed anything yet
    pub fn circuit_state(&self, group_key: &str) -> CircuitState {
        self.circuits.state(group_key)
    }

    pub fn circuit_metrics(&self, group_key: &str) -> Option<CircuitBreakerMetrics> {
        self.circuits.metrics(group_key)
    }

    /// Force a group's circuit Closed
    pub fn reset_circuit(&self, group_key: &str) -> bool {
        self.circuits.reset(group_key)
    }

    /// Gate in front of the queue for `group_key`, built from its `GatePolicy`
    ///
    /// Requests that survive the gate are submitted; their `Completion`s are
    /// delivered on [`GatedInput::next_completion`].
    ///
    /// # Errors
    /// The group has no gate configured, or no tokio runtime.
    pub fn gated_input(&self, group_key: &str) -> Result<GatedInput<E>, ConfigError> {
        let Some(policy) = self.policies.policy_for(group_key).gate else {
            return Err(CommonError::config_field(
                format!("groups.{group_key}.gate"),
                "no gate configured for this group",
            )
            .into());
        };

        let (tx, completions) = mpsc::unbounded_channel();
        let queue = self.queue.clone();
        let gate = Gate::from_policy(&policy, move |request: OperationRequest<E::Payload>| {
            let completion = queue.submit(request);
            // Dropped receiver: the caller no longer wants the completions.
            let _ = tx.send(completion);
        })?;

        Ok(GatedInput { group_key: group_key.to_string(), gate, completions })
    }

    pub fn queue(&self) -> &BatchingQueue<E> {
        &self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Flush open batches, finish dispatching and refuse further work
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

/// Gate feeding one group of a [`ResilientExecutor`]
pub struct GatedInput<E: BatchExecutor> {
    group_key: String,
    gate: Gate<OperationRequest<E::Payload>>,
    completions: mpsc::UnboundedReceiver<Completion<E::Output>>,
}

impl<E: BatchExecutor> GatedInput<E> {
    /// Offer a request to the gate; its `group_key` is replaced with this
    /// input's group
    pub fn send(&self, mut request: OperationRequest<E::Payload>) {
        request.group_key.clone_from(&self.group_key);
        self.gate.on_event(request);
    }

    /// Next completion of a request that passed the gate
    pub async fn next_completion(&mut self) -> Option<Completion<E::Output>> {
        self.completions.recv().await
    }

    pub fn try_next_completion(&mut self) -> Option<Completion<E::Output>> {
        self.completions.try_recv().ok()
    }

    pub fn group_key(&self) -> &str {
        &self.group_key
    }

    pub fn gate(&self) -> &Gate<OperationRequest<E::Payload>> {
        &self.gate
    }

    /// Drop a pending request without submitting it
    pub fn reset(&self) {
        self.gate.reset();
    }

    /// Submit a pending request now
    pub fn flush(&self) -> bool {
        self.gate.flush()
    }
}
