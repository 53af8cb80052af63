//! Debounce / throttle gates
//!
//! A gate reduces a high-frequency event stream to a bounded-rate one and can
//! sit in front of the batching queue (see
//! [`crate::ResilientExecutor::gated_input`]). Each gate instance owns at most
//! one timer.

mod debounce;
mod throttle;

use std::sync::Arc;
use std::time::Duration;

pub use debounce::Debouncer;
pub use throttle::Throttler;

use crate::config::{ConfigError, GatePolicy};

/// Callback receiving surviving events
pub type Emitter<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Either gate, selected by [`GatePolicy`]
pub enum Gate<T> {
    Debounce(Debouncer<T>),
    Throttle(Throttler<T>),
}

impl<T: Send + 'static> Gate<T> {
    /// # Errors
    /// Invalid policy, or no tokio runtime.
    pub fn from_policy<F>(policy: &GatePolicy, emit: F) -> Result<Self, ConfigError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        match policy {
            GatePolicy::Debounce { debounce_delay } => {
                Ok(Self::Debounce(Debouncer::new(*debounce_delay, emit)?))
            }
            GatePolicy::Throttle { throttle_interval, edge } => {
                Ok(Self::Throttle(Throttler::new(*throttle_interval, *edge, emit)?))
            }
        }
    }

    pub fn on_event(&self, value: T) {
        match self {
            Self::Debounce(gate) => gate.on_event(value),
            Self::Throttle(gate) => gate.on_event(value),
        }
    }

    /// Cancel a pending emission without firing it
    pub fn reset(&self) {
        match self {
            Self::Debounce(gate) => gate.reset(),
            Self::Throttle(gate) => gate.reset(),
        }
    }

    /// Emit a pending value now
    pub fn flush(&self) -> bool {
        match self {
            Self::Debounce(gate) => gate.flush(),
            Self::Throttle(gate) => gate.flush(),
        }
    }
}

impl<T> Gate<T> {
    pub fn is_pending(&self) -> bool {
        match self {
            Self::Debounce(gate) => gate.is_pending(),
            Self::Throttle(gate) => gate.is_pending(),
        }
    }

    pub fn emissions(&self) -> u64 {
        match self {
            Self::Debounce(gate) => gate.emissions(),
            Self::Throttle(gate) => gate.emissions(),
        }
    }

    /// Delay (debounce) or interval (throttle)
    pub fn period(&self) -> Duration {
        match self {
            Self::Debounce(gate) => gate.delay(),
            Self::Throttle(gate) => gate.interval(),
        }
    }
}
