//! Batching / coalescing queue
//!
//! ```text
//!  submit ──► in-flight table ──(same id)──► existing Completion
//!                 │ new id
//!                 ▼
//!           open batch per group ──(size | window timer)──► flush
//!                                                              │
//!                      group dispatcher (priority heap) ◄──────┘
//!                                 │
//!          deadline filter ─► circuit permit ─► BatchExecutor::invoke
//!                                 │
//!                     success / permanent ─► resolve
//!                     transient ─► backoff sleep ─► re-admit
//! ```
//!
//! Each group owns one mutex (its open batch) and one dispatcher task, so
//! batches of a group execute one at a time while groups run independently.
//! Lock order: a group mutex may be taken while touching the in-flight table,
//! never the other way round.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tideguard_common::{Clock, TokioClock};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::completion::Completion;
use super::ports::{Batch, BatchExecutor, BatchMember, BatchResult};
use crate::config::{ConfigError, GroupPolicy};
use crate::error::{ExecutionError, OperationError, Outcome};
use crate::observability::{error_label, log_batch_execution};
use crate::registry::{CircuitRegistry, PolicyRegistry};
use crate::request::{OperationRequest, Priority, RequestId};

/// Pending retry of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Attempt that failed, 0-based
    pub attempt_number: u32,
    pub last_error: OperationError,
    /// When the request is re-admitted
    pub next_eligible_at: Instant,
}

/// Where an in-flight request currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStage {
    /// In an open or flushed batch, not yet handed to the executor
    Pending,
    /// Inside an executor call
    Executing,
    /// Sleeping out a backoff delay
    AwaitingRetry(RetryAttempt),
}

/// Counters since the queue was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub coalesced: u64,
    pub batches_flushed: u64,
    pub executor_calls: u64,
    pub retries_scheduled: u64,
    pub deadline_drops: u64,
    pub circuit_rejections: u64,
    pub cancelled: u64,
    pub resolved: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    coalesced: AtomicU64,
    batches_flushed: AtomicU64,
    executor_calls: AtomicU64,
    retries_scheduled: AtomicU64,
    deadline_drops: AtomicU64,
    circuit_rejections: AtomicU64,
    cancelled: AtomicU64,
    resolved: AtomicU64,
}

impl QueueCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            executor_calls: self.executor_calls.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            deadline_drops: self.deadline_drops.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
        }
    }
}

struct InFlight<T> {
    group_key: String,
    ticket: u64,
    sender: oneshot::Sender<Outcome<T>>,
    completion: Completion<T>,
    stage: RequestStage,
}

/// Flushed batch waiting for its group's dispatcher
struct QueuedBatch<P> {
    priority: Priority,
    batch: Batch<P>,
}

impl<P> QueuedBatch<P> {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.batch.sequence))
    }
}

impl<P> PartialEq for QueuedBatch<P> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<P> Eq for QueuedBatch<P> {}

impl<P> PartialOrd for QueuedBatch<P> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for QueuedBatch<P> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

struct GroupState<P> {
    open: Option<Batch<P>>,
    next_sequence: u64,
    window_timer: Option<JoinHandle<()>>,
    mailbox: Option<mpsc::UnboundedSender<QueuedBatch<P>>>,
    dispatcher: Option<JoinHandle<()>>,
}

struct GroupHandle<P> {
    key: String,
    state: Mutex<GroupState<P>>,
}

struct QueueInner<E: BatchExecutor> {
    executor: Arc<E>,
    policies: Arc<PolicyRegistry>,
    circuits: Arc<CircuitRegistry>,
    groups: DashMap<String, Arc<GroupHandle<E::Payload>>>,
    in_flight: DashMap<RequestId, InFlight<E::Output>>,
    next_ticket: AtomicU64,
    counters: QueueCounters,
    rng: Mutex<StdRng>,
    runtime: Handle,
    shutting_down: AtomicBool,
}

/// Groups requests per `group_key` and runs them through the executor
///
/// Cheap to clone; clones share the same queue.
pub struct BatchingQueue<E: BatchExecutor> {
    inner: Arc<QueueInner<E>>,
}

impl<E: BatchExecutor> Clone for BatchingQueue<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: BatchExecutor> BatchingQueue<E> {
    /// Create a queue bound to the current tokio runtime
    ///
    /// # Errors
    /// [`ConfigError::NoRuntime`] when called outside a tokio runtime.
    pub fn new(
        executor: Arc<E>,
        policies: Arc<PolicyRegistry>,
        circuits: Arc<CircuitRegistry>,
        jitter_seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        let runtime = Handle::try_current().map_err(|err| ConfigError::NoRuntime(err.to_string()))?;
        let rng = match jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            inner: Arc::new(QueueInner {
                executor,
                policies,
                circuits,
                groups: DashMap::new(),
                in_flight: DashMap::new(),
                next_ticket: AtomicU64::new(0),
                counters: QueueCounters::default(),
                rng: Mutex::new(rng),
                runtime,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    /// Admit a request; never blocks on execution
    ///
    /// A request whose id is already in flight is coalesced: the existing
    /// `Completion` is returned and the new payload is discarded.
    pub fn submit(&self, request: OperationRequest<E::Payload>) -> Completion<E::Output> {
        self.inner.submit(request)
    }

    /// Cancel an in-flight request; false if the id is not in flight
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.inner.cancel(id)
    }

    /// Flush the group's open batch now; false if there was nothing to flush
    pub fn flush(&self, group_key: &str) -> bool {
        match self.inner.groups.get(group_key).map(|group| Arc::clone(group.value())) {
            Some(group) => {
                let mut state = group.state.lock();
                self.inner.flush_locked(&group, &mut state, "manual")
            }
            None => false,
        }
    }

    /// Flush every open batch; returns how many were flushed
    pub fn flush_all(&self) -> usize {
        self.inner.flush_all("manual")
    }

    /// Flush everything, stop accepting work and wait for the dispatchers
    ///
    /// Requests waiting out a backoff resolve with `ShutDown`; later
    /// submissions resolve with `ShutDown` immediately.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Members in the group's open batch
    pub fn pending_count(&self, group_key: &str) -> usize {
        self.inner
            .groups
            .get(group_key)
            .map(|group| Arc::clone(group.value()))
            .map_or(0, |group| group.state.lock().open.as_ref().map_or(0, Batch::len))
    }

    /// Requests submitted but not yet resolved
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Stage of an in-flight request
    pub fn stage(&self, id: &RequestId) -> Option<RequestStage> {
        self.inner.in_flight.get(id).map(|entry| entry.stage.clone())
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.counters.snapshot()
    }
}

impl<E: BatchExecutor> QueueInner<E> {
    fn submit(self: &Arc<Self>, request: OperationRequest<E::Payload>) -> Completion<E::Output> {
        let OperationRequest { id, group_key, payload, priority, submitted_at, deadline } = request;

        if self.shutting_down.load(Ordering::SeqCst) {
            return Completion::ready(id, Err(ExecutionError::ShutDown));
        }

        let (completion, ticket) = match self.in_flight.entry(id.clone()) {
            Entry::Occupied(existing) => {
                QueueCounters::bump(&self.counters.coalesced, 1);
                debug!(group_key = %existing.get().group_key, request_id = %id, "request coalesced");
                return existing.get().completion.clone();
            }
            Entry::Vacant(slot) => {
                let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                let (sender, completion) = Completion::channel(id.clone());
                slot.insert(InFlight {
                    group_key: group_key.clone(),
                    ticket,
                    sender,
                    completion: completion.clone(),
                    stage: RequestStage::Pending,
                });
                (completion, ticket)
            }
        };

        QueueCounters::bump(&self.counters.submitted, 1);
        let member = BatchMember { id, payload, priority, submitted_at, deadline, attempt: 0, ticket };
        self.admit(&group_key, member);
        completion
    }

    fn admit(self: &Arc<Self>, group_key: &str, member: BatchMember<E::Payload>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.resolve(&member.id, member.ticket, Err(ExecutionError::ShutDown));
            return;
        }

        let policy = self.policies.policy_for(group_key).batch;
        let group = self.group(group_key);
        let mut state = group.state.lock();

        if state.open.is_none() {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.open = Some(Batch::new(group_key.to_string(), sequence, TokioClock.now()));
            state.window_timer = Some(self.spawn_window_timer(group_key, sequence, policy.max_batch_window));
        }

        let full = match state.open.as_mut() {
            Some(batch) => {
                batch.members.push(member);
                batch.len() >= policy.max_batch_size
            }
            None => false,
        };

        if full {
            self.flush_locked(&group, &mut state, "size");
        }
    }

    fn group(self: &Arc<Self>, group_key: &str) -> Arc<GroupHandle<E::Payload>> {
        if let Some(group) = self.groups.get(group_key) {
            return Arc::clone(group.value());
        }

        let entry = self.groups.entry(group_key.to_string()).or_insert_with(|| {
            let (mailbox, receiver) = mpsc::unbounded_channel();
            let dispatcher =
                self.runtime.spawn(run_dispatcher(Arc::downgrade(self), group_key.to_string(), receiver));
            debug!(group_key, "group dispatcher started");

            Arc::new(GroupHandle {
                key: group_key.to_string(),
                state: Mutex::new(GroupState {
                    open: None,
                    next_sequence: 0,
                    window_timer: None,
                    mailbox: Some(mailbox),
                    dispatcher: Some(dispatcher),
                }),
            })
        });
        Arc::clone(entry.value())
    }

    fn spawn_window_timer(
        self: &Arc<Self>,
        group_key: &str,
        sequence: u64,
        window: std::time::Duration,
    ) -> JoinHandle<()> {
        let queue = Arc::downgrade(self);
        let group_key = group_key.to_string();

        self.runtime.spawn(async move {
            tokio::time::sleep(window).await;
            let Some(queue) = queue.upgrade() else {
                return;
            };
            let Some(group) = queue.groups.get(&group_key).map(|group| Arc::clone(group.value()))
            else {
                return;
            };

            let mut state = group.state.lock();
            // A newer batch has its own timer.
            if state.open.as_ref().is_some_and(|batch| batch.sequence == sequence) {
                state.window_timer = None;
                queue.flush_locked(&group, &mut state, "window");
            }
        })
    }

    /// Hand the open batch to the dispatcher; caller holds the group lock
    fn flush_locked(
        &self,
        group: &GroupHandle<E::Payload>,
        state: &mut GroupState<E::Payload>,
        trigger: &'static str,
    ) -> bool {
        if let Some(timer) = state.window_timer.take() {
            timer.abort();
        }
        let Some(mut batch) = state.open.take() else {
            return false;
        };

        // Expired members resolve now, not after the dispatcher frees up.
        let now = TokioClock.now();
        let (expired, members): (Vec<_>, Vec<_>) =
            batch.members.drain(..).partition(|member| member.is_expired_at(now));
        batch.members = members;
        if !expired.is_empty() {
            QueueCounters::bump(&self.counters.deadline_drops, expired.len() as u64);
            debug!(group_key = %group.key, expired = expired.len(), "expired members dropped at flush");
        }
        for member in expired {
            let err = ExecutionError::DeadlineExceeded { id: member.id.clone() };
            self.resolve(&member.id, member.ticket, Err(err));
        }
        if batch.is_empty() {
            return false;
        }

        QueueCounters::bump(&self.counters.batches_flushed, 1);
        debug!(
            group_key = %group.key,
            sequence = batch.sequence,
            batch_size = batch.len(),
            trigger,
            "batch flushed"
        );

        let queued = QueuedBatch { priority: batch.priority(), batch };
        let rejected = match state.mailbox.as_ref() {
            Some(mailbox) => mailbox.send(queued).err().map(|err| err.0.batch),
            None => Some(queued.batch),
        };

        if let Some(batch) = rejected {
            for member in batch.members {
                self.resolve(&member.id, member.ticket, Err(ExecutionError::ShutDown));
            }
        }
        true
    }

    fn flush_all(&self, trigger: &'static str) -> usize {
        let groups: Vec<_> = self.groups.iter().map(|group| Arc::clone(group.value())).collect();
        let mut flushed = 0;
        for group in &groups {
            let mut state = group.state.lock();
            if self.flush_locked(group, &mut state, trigger) {
                flushed += 1;
            }
        }
        flushed
    }

    async fn dispatch(self: &Arc<Self>, batch: Batch<E::Payload>) {
        let Batch { group_key, sequence, created_at, members } = batch;
        let now = TokioClock.now();

        let mut live = Vec::with_capacity(members.len());
        for member in members {
            if !self.is_live(&member.id, member.ticket) {
                continue;
            }
            if member.is_expired_at(now) {
                QueueCounters::bump(&self.counters.deadline_drops, 1);
                let err = ExecutionError::DeadlineExceeded { id: member.id.clone() };
                self.resolve(&member.id, member.ticket, Err(err));
                continue;
            }
            live.push(member);
        }
        if live.is_empty() {
            return;
        }

        let policy = self.policies.policy_for(&group_key);
        let breaker = match self.circuits.breaker_for(&group_key, &policy.circuit) {
            Ok(breaker) => breaker,
            Err(err) => {
                warn!(group_key, error = %err, "no circuit breaker for group");
                let err = ExecutionError::Permanent { message: err.to_string() };
                for member in live {
                    self.resolve(&member.id, member.ticket, Err(err.clone()));
                }
                return;
            }
        };

        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(open) => {
                QueueCounters::bump(&self.counters.circuit_rejections, live.len() as u64);
                debug!(group_key, batch_size = live.len(), "circuit open, batch rejected");
                let err = ExecutionError::CircuitOpen {
                    group_key: group_key.clone(),
                    retry_after: open.retry_after,
                };
                for member in live {
                    self.resolve(&member.id, member.ticket, Err(err.clone()));
                }
                return;
            }
        };

        for member in &live {
            self.set_stage(&member.id, member.ticket, RequestStage::Executing);
        }

        let batch = Batch { group_key, sequence, created_at, members: live };
        QueueCounters::bump(&self.counters.executor_calls, 1);
        let started = TokioClock.now();
        let result = AssertUnwindSafe(self.executor.invoke(&batch))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                warn!(group_key = %batch.group_key, "executor panicked");
                BatchResult::Failed(OperationError::transient("executor panicked"))
            });

        let outcomes = result.into_member_outcomes(batch.len());
        let failed = outcomes.iter().filter(|outcome| outcome.is_err()).count();
        let elapsed = TokioClock.now().saturating_duration_since(started);
        log_batch_execution(&batch.group_key, sequence, batch.len(), failed, elapsed);

        if failed == outcomes.len() {
            permit.record_failure();
        } else {
            permit.record_success();
        }

        let Batch { group_key, members, .. } = batch;
        for (member, outcome) in members.into_iter().zip(outcomes) {
            match outcome {
                Ok(value) => self.resolve(&member.id, member.ticket, Ok(value)),
                Err(err) if err.is_transient() => self.schedule_retry(&group_key, &policy, member, err),
                Err(err) => self.resolve(&member.id, member.ticket, Err(err.into())),
            }
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        group_key: &str,
        policy: &GroupPolicy,
        mut member: BatchMember<E::Payload>,
        err: OperationError,
    ) {
        let max_retries = policy.retry.max_retries;
        if max_retries == 0 {
            self.resolve(&member.id, member.ticket, Err(err.into()));
            return;
        }
        if member.attempt >= max_retries {
            let exhausted =
                ExecutionError::MaxRetriesExceeded { attempts: member.attempt + 1, last_error: err };
            self.resolve(&member.id, member.ticket, Err(exhausted));
            return;
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            self.resolve(&member.id, member.ticket, Err(ExecutionError::ShutDown));
            return;
        }

        let delay = policy.backoff.compute_delay(member.attempt, &mut *self.rng.lock());
        let next_eligible_at = TokioClock.now() + delay;
        if member.deadline.is_some_and(|deadline| next_eligible_at >= deadline) {
            QueueCounters::bump(&self.counters.deadline_drops, 1);
            let expired = ExecutionError::DeadlineExceeded { id: member.id.clone() };
            self.resolve(&member.id, member.ticket, Err(expired));
            return;
        }

        let retry = RetryAttempt { attempt_number: member.attempt, last_error: err, next_eligible_at };
        if !self.set_stage(&member.id, member.ticket, RequestStage::AwaitingRetry(retry)) {
            return;
        }

        QueueCounters::bump(&self.counters.retries_scheduled, 1);
        debug!(
            group_key,
            request_id = %member.id,
            attempt = member.attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        member.attempt += 1;
        let queue = Arc::downgrade(self);
        let group_key = group_key.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(queue) = queue.upgrade() {
                queue.readmit(&group_key, member);
            }
        });
    }

    fn readmit(self: &Arc<Self>, group_key: &str, member: BatchMember<E::Payload>) {
        // Cancelled or shut down while sleeping.
        if !self.set_stage(&member.id, member.ticket, RequestStage::Pending) {
            return;
        }
        self.admit(group_key, member);
    }

    fn is_live(&self, id: &RequestId, ticket: u64) -> bool {
        self.in_flight.get(id).is_some_and(|entry| entry.ticket == ticket)
    }

    fn set_stage(&self, id: &RequestId, ticket: u64, stage: RequestStage) -> bool {
        match self.in_flight.get_mut(id) {
            Some(mut entry) if entry.ticket == ticket => {
                entry.stage = stage;
                true
            }
            _ => false,
        }
    }

    fn resolve(&self, id: &RequestId, ticket: u64, outcome: Outcome<E::Output>) {
        let Some((_, entry)) = self.in_flight.remove_if(id, |_, entry| entry.ticket == ticket) else {
            return;
        };

        QueueCounters::bump(&self.counters.resolved, 1);
        if let Err(err) = &outcome {
            debug!(
                group_key = %entry.group_key,
                request_id = %id,
                error = error_label(err),
                "request failed"
            );
        }
        // The caller may have dropped every Completion.
        let _ = entry.sender.send(outcome);
    }

    fn cancel(&self, id: &RequestId) -> bool {
        let Some((_, entry)) = self.in_flight.remove(id) else {
            return false;
        };

        if entry.stage == RequestStage::Pending {
            let group = self.groups.get(&entry.group_key).map(|group| Arc::clone(group.value()));
            if let Some(group) = group {
                let mut state = group.state.lock();
                if let Some(batch) = state.open.as_mut() {
                    batch.members.retain(|member| member.ticket != entry.ticket);
                }
                if state.open.as_ref().is_some_and(Batch::is_empty) {
                    state.open = None;
                    if let Some(timer) = state.window_timer.take() {
                        timer.abort();
                    }
                }
            }
        }

        QueueCounters::bump(&self.counters.cancelled, 1);
        QueueCounters::bump(&self.counters.resolved, 1);
        debug!(group_key = %entry.group_key, request_id = %id, stage = ?entry.stage, "request cancelled");
        let _ = entry.sender.send(Err(ExecutionError::Cancelled { id: id.clone() }));
        true
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(in_flight = self.in_flight.len(), "batching queue shutting down");

        let flushed = self.flush_all("shutdown");
        let groups: Vec<_> = self.groups.iter().map(|group| Arc::clone(group.value())).collect();
        let mut dispatchers = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut state = group.state.lock();
            state.mailbox = None;
            dispatchers.extend(state.dispatcher.take());
        }

        let waiting: Vec<(RequestId, u64)> = self
            .in_flight
            .iter()
            .filter(|entry| matches!(entry.stage, RequestStage::AwaitingRetry(_)))
            .map(|entry| (entry.key().clone(), entry.ticket))
            .collect();
        for (id, ticket) in waiting {
            self.resolve(&id, ticket, Err(ExecutionError::ShutDown));
        }

        for dispatcher in dispatchers {
            if let Err(err) = dispatcher.await {
                warn!(error = %err, "group dispatcher ended abnormally");
            }
        }
        info!(flushed, "batching queue shut down");
    }
}

/// Serve one group's flushed batches, highest priority first
async fn run_dispatcher<E: BatchExecutor>(
    queue: Weak<QueueInner<E>>,
    group_key: String,
    mut mailbox: mpsc::UnboundedReceiver<QueuedBatch<E::Payload>>,
) {
    let mut waiting = BinaryHeap::new();

    loop {
        if waiting.is_empty() {
            match mailbox.recv().await {
                Some(queued) => waiting.push(queued),
                None => break,
            }
        }
        while let Ok(queued) = mailbox.try_recv() {
            waiting.push(queued);
        }

        let Some(queued) = waiting.pop() else {
            continue;
        };
        let Some(queue) = queue.upgrade() else {
            break;
        };
        queue.dispatch(queued.batch).await;
    }

    debug!(group_key, "group dispatcher stopped");
}
