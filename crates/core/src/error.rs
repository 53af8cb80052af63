//! Request-level error taxonomy
//!
//! [`OperationError`] is what a [`crate::BatchExecutor`] reports for a call or
//! a member. [`ExecutionError`] is what a caller's `Completion` resolves to;
//! it adds the failures produced locally by the request layer (open circuit,
//! expired deadline, exhausted retries, cancellation, shutdown).

use std::time::Duration;

use thiserror::Error;
use tideguard_common::{CommonError, ErrorClassification, ErrorSeverity};

use crate::request::RequestId;

/// Result delivered to a caller
pub type Outcome<T> = Result<T, ExecutionError>;

/// Failure classification reported by the underlying operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// Network timeout, 5xx-equivalent, temporary exhaustion; may be retried
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed request, auth failure, validation error; never retried
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl OperationError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Permanent(message) => message,
        }
    }
}

impl ErrorClassification for OperationError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transient(_) => ErrorSeverity::Warning,
            Self::Permanent(_) => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Error a request's `Completion` resolves with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// Transient failure surfaced without retry (breaker accounting only)
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Permanent failure; never retried
    #[error("permanent failure: {message}")]
    Permanent { message: String },

    /// The group's circuit is open; the executor was not invoked
    #[error("circuit open for group '{group_key}'")]
    CircuitOpen { group_key: String, retry_after: Option<Duration> },

    /// The request's deadline passed before it could be executed
    #[error("deadline exceeded for request {id}")]
    DeadlineExceeded { id: RequestId },

    /// Retries exhausted on a transient failure
    #[error("gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: OperationError },

    /// Cancelled by the caller
    #[error("request {id} cancelled")]
    Cancelled { id: RequestId },

    /// The executor shut down before the request resolved
    #[error("executor shut down")]
    ShutDown,
}

impl ExecutionError {
    /// Whether the breaker fast-failed this request
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl From<OperationError> for ExecutionError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::Transient(message) => Self::Transient { message },
            OperationError::Permanent(message) => Self::Permanent { message },
        }
    }
}

impl ErrorClassification for ExecutionError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::CircuitOpen { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Transient { .. } | Self::CircuitOpen { .. } | Self::DeadlineExceeded { .. } => {
                ErrorSeverity::Warning
            }
            Self::Permanent { .. } | Self::MaxRetriesExceeded { .. } => ErrorSeverity::Error,
            Self::Cancelled { .. } | Self::ShutDown => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

const EXECUTOR_SERVICE: &str = "batch_executor";

impl From<ExecutionError> for CommonError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Transient { message } => {
                CommonError::backend(EXECUTOR_SERVICE, message, true)
            }
            ExecutionError::Permanent { message } => {
                CommonError::backend(EXECUTOR_SERVICE, message, false)
            }
            ExecutionError::CircuitOpen { group_key, retry_after: Some(retry_after) } => {
                CommonError::circuit_breaker_with_retry(group_key, retry_after)
            }
            ExecutionError::CircuitOpen { group_key, retry_after: None } => {
                CommonError::circuit_breaker(group_key)
            }
            ExecutionError::DeadlineExceeded { id } => {
                CommonError::task_cancelled_with_reason(id.to_string(), "deadline exceeded")
            }
            err @ ExecutionError::MaxRetriesExceeded { .. } => {
                CommonError::backend(EXECUTOR_SERVICE, err.to_string(), false)
            }
            ExecutionError::Cancelled { id } => CommonError::task_cancelled(id.to_string()),
            ExecutionError::ShutDown => {
                CommonError::task_cancelled_with_reason("executor", "shut down")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Executor classifications map onto the caller taxonomy.
    #[test]
    fn test_operation_error_into_execution_error() {
        assert_eq!(
            ExecutionError::from(OperationError::transient("503")),
            ExecutionError::Transient { message: "503".into() }
        );
        assert_eq!(
            ExecutionError::from(OperationError::permanent("400")),
            ExecutionError::Permanent { message: "400".into() }
        );
    }

    /// Only transient failures are retryable at the operation level.
    #[test]
    fn test_operation_error_classification() {
        assert!(OperationError::transient("timeout").is_retryable());
        assert!(!OperationError::permanent("bad request").is_retryable());
        assert_eq!(OperationError::permanent("bad request").severity(), ErrorSeverity::Error);
        assert_eq!(OperationError::transient("x").message(), "x");
    }

    /// Circuit-open errors are distinguishable and carry a retry hint.
    #[test]
    fn test_circuit_open_is_distinguishable() {
        let err = ExecutionError::CircuitOpen {
            group_key: "search".into(),
            retry_after: Some(Duration::from_secs(4)),
        };

        assert!(err.is_circuit_open());
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
        assert_eq!(err.to_string(), "circuit open for group 'search'");
    }

    /// Exhausted retries report attempts and the last failure.
    #[test]
    fn test_max_retries_display() {
        let err = ExecutionError::MaxRetriesExceeded {
            attempts: 4,
            last_error: OperationError::transient("connection reset"),
        };

        assert_eq!(err.to_string(), "gave up after 4 attempts: transient failure: connection reset");
        assert!(!err.is_retryable());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    /// Conversions into `CommonError` keep the retryable flag and circuit hint.
    #[test]
    fn test_into_common_error() {
        let transient: CommonError = ExecutionError::Transient { message: "503".into() }.into();
        assert!(transient.is_retryable());

        let permanent: CommonError = ExecutionError::Permanent { message: "400".into() }.into();
        assert!(!permanent.is_retryable());

        let open: CommonError = ExecutionError::CircuitOpen {
            group_key: "billing".into(),
            retry_after: Some(Duration::from_secs(1)),
        }
        .into();
        assert_eq!(open.retry_after(), Some(Duration::from_secs(1)));

        let cancelled: CommonError = ExecutionError::Cancelled { id: "r1".into() }.into();
        assert_eq!(cancelled.severity(), ErrorSeverity::Info);
    }
}
