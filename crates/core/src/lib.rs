//! # Tideguard Core
//!
//! Resilient request execution: decides when and how often an operation is
//! attempted, and how concurrent demand for it is grouped.
//!
//! This crate contains:
//! - The request data model ([`OperationRequest`], [`RequestId`], [`Priority`])
//! - The batching / coalescing queue and its executor port ([`batch`])
//! - Debounce and throttle gates ([`gate`])
//! - Per-group circuit and policy registries ([`registry`])
//! - Configuration and its loader ([`config`]), logging bootstrap
//!   ([`observability`])
//!
//! Backoff, the circuit breaker and the clock abstraction live in
//! `tideguard-common` and are re-exported here.
//!
//! ## Architecture Principles
//! - The only outward call is [`BatchExecutor::invoke`]
//! - No global state: every registry is owned by a [`ResilientExecutor`]
//! - Callers get a [`Completion`] future, never a callback

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod observability;
pub mod registry;
pub mod request;

pub use batch::{
    Batch, BatchExecutor, BatchMember, BatchResult, BatchingQueue, Completion, QueueStats,
    RequestStage, RetryAttempt,
};
pub use config::{
    BatchPolicy, CircuitPolicy, ConfigError, ExecutorConfig, GatePolicy, GroupOverride,
    GroupPolicy, LoggingConfig, PolicyUpdate, RetryPolicy, ThrottleEdge,
};
pub use error::{ExecutionError, OperationError, Outcome};
pub use executor::{GatedInput, ResilientExecutor};
pub use gate::{Debouncer, Gate, Throttler};
pub use request::{OperationRequest, Priority, RequestId};
pub use tideguard_common::{
    BackoffPolicy, BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
