//! Common utility functions
//!
//! - **[`serde`]**: serialization helpers for durations in config files

pub mod serde;

pub use self::serde::{duration_millis, option_duration_millis};
