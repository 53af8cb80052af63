//! Batching, coalescing and retry of operation requests

mod completion;
pub mod ports;
mod queue;

pub use completion::Completion;
pub use ports::{Batch, BatchExecutor, BatchMember, BatchResult};
pub use queue::{BatchingQueue, QueueStats, RequestStage, RetryAttempt};
