//! Port interface for the underlying batch executor
//!
//! This is the only outward call the request layer makes. Everything before
//! it (grouping, coalescing, circuit checks) and after it (classification,
//! retries) is handled by the queue.

use std::time::Instant;

use async_trait::async_trait;

use crate::error::OperationError;
use crate::request::{Priority, RequestId};

/// A flushed group of requests for one `group_key`
#[derive(Debug)]
pub struct Batch<P> {
    pub group_key: String,
    /// Per-group batch number, strictly increasing
    pub sequence: u64,
    /// Admission time of the first member
    pub created_at: Instant,
    /// Members in admission order
    pub members: Vec<BatchMember<P>>,
}

impl<P> Batch<P> {
    pub(crate) fn new(group_key: String, sequence: u64, created_at: Instant) -> Self {
        Self { group_key, sequence, created_at, members: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Highest member priority; `Low` for an empty batch
    pub fn priority(&self) -> Priority {
        self.members.iter().map(|member| member.priority).max().unwrap_or(Priority::Low)
    }

    /// Member payloads in order
    pub fn payloads(&self) -> impl Iterator<Item = &P> {
        self.members.iter().map(|member| &member.payload)
    }

    pub fn ids(&self) -> impl Iterator<Item = &RequestId> {
        self.members.iter().map(|member| &member.id)
    }
}

/// One request inside a batch
#[derive(Debug)]
pub struct BatchMember<P> {
    pub id: RequestId,
    pub payload: P,
    pub priority: Priority,
    pub submitted_at: Instant,
    pub deadline: Option<Instant>,
    /// 0 on the first execution, incremented on every retry
    pub attempt: u32,
    /// Distinguishes this submission from a later one reusing the same id
    pub(crate) ticket: u64,
}

impl<P> BatchMember<P> {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

/// Result of one executor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchResult<T> {
    /// A single outcome shared by every member
    All(Result<T, OperationError>),
    /// One outcome per member, in member order
    PerMember(Vec<Result<T, OperationError>>),
    /// The call itself failed; every member fails identically
    Failed(OperationError),
}

impl<T: Clone> BatchResult<T> {
    /// Expand into exactly `len` member outcomes
    ///
    /// A `PerMember` list of the wrong length counts as a transient transport
    /// failure for the whole batch.
    pub fn into_member_outcomes(self, len: usize) -> Vec<Result<T, OperationError>> {
        match self {
            Self::All(outcome) => vec![outcome; len],
            Self::PerMember(outcomes) if outcomes.len() == len => outcomes,
            Self::PerMember(outcomes) => {
                tracing::warn!(
                    expected = len,
                    received = outcomes.len(),
                    "executor returned the wrong number of member outcomes"
                );
                vec![
                    Err(OperationError::transient(format!(
                        "executor returned {} outcomes for {len} members",
                        outcomes.len()
                    )));
                    len
                ]
            }
            Self::Failed(err) => vec![Err(err); len],
        }
    }
}

/// The operation being protected
///
/// Called once per flushed batch, from the group's dispatcher. A panic inside
/// `invoke` is treated as a transient transport failure.
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    /// Opaque per-request input
    type Payload: Send + Sync + 'static;
    /// Per-request success value
    type Output: Clone + Send + Sync + 'static;

    async fn invoke(&self, batch: &Batch<Self::Payload>) -> BatchResult<Self::Output>;
}
