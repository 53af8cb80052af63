//! Testing utilities and helpers
//!
//! - **[`async_utils`]**: eventually-style assertions and timeouts that work
//!   under tokio's paused clock
//! - **[`rng`]**: seeded random sources for reproducible jitter
//!
//! `MockClock` lives with the other clocks and is re-exported here.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tideguard_common::testing::{seeded_rng, MockClock};
//! use tideguard_common::BackoffPolicy;
//!
//! let clock = MockClock::new();
//! clock.advance(Duration::from_secs(5));
//!
//! let mut rng = seeded_rng();
//! let delay = BackoffPolicy::default().compute_delay(0, &mut rng);
//! assert!(delay >= Duration::from_secs(1));
//! ```

pub mod async_utils;
pub mod rng;

// Note: macros exported with #[macro_export] are available at crate root
pub use async_utils::{poll_until, timeout_ok};
pub use rng::{seeded_rng, seeded_rng_from, TEST_SEED};

pub use crate::resilience::clock::{Clock, MockClock, SystemClock, TokioClock};
