//! Operation request data model

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tideguard_common::{Clock, TokioClock};
use uuid::Uuid;

/// Caller-visible identity of a request
///
/// Two submissions with the same id while the first is still pending are
/// coalesced into one execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Fresh random id (UUID v4)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Uuid> for RequestId {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

/// Dispatch priority
///
/// Ordered `Low < Normal < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// A unit of work submitted to the executor
///
/// The payload is opaque to the request layer; only the batch executor looks
/// inside it.
#[derive(Debug, Clone)]
pub struct OperationRequest<P> {
    pub id: RequestId,
    pub group_key: String,
    pub payload: P,
    pub priority: Priority,
    pub submitted_at: Instant,
    /// Absolute time after which the request must not be executed
    pub deadline: Option<Instant>,
}

impl<P> OperationRequest<P> {
    /// New request with a generated id, normal priority and no deadline
    pub fn new(group_key: impl Into<String>, payload: P) -> Self {
        Self {
            id: RequestId::generate(),
            group_key: group_key.into(),
            payload,
            priority: Priority::Normal,
            submitted_at: TokioClock.now(),
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to `submitted_at`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.submitted_at + timeout);
        self
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
