//! Trailing-edge debouncer

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tideguard_common::CommonError;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Emitter;
use crate::config::ConfigError;

struct DebounceState<T> {
    pending: Option<T>,
    /// Bumped on every event, reset and flush; a timer only fires if its
    /// generation is still current
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct DebounceInner<T> {
    delay: Duration,
    emit: Emitter<T>,
    state: Mutex<DebounceState<T>>,
    emissions: AtomicU64,
    runtime: Handle,
}

impl<T> DebounceInner<T> {
    fn fire(&self, generation: u64) {
        let value = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            state.pending.take()
        };

        if let Some(value) = value {
            self.emissions.fetch_add(1, Ordering::Relaxed);
            (self.emit)(value);
        }
    }
}

/// Emits the last event after `delay` of silence
///
/// Every event cancels the running timer and starts a new one, so there is at
/// most one timer per debouncer.
pub struct Debouncer<T> {
    inner: Arc<DebounceInner<T>>,
}

impl<T: Send + 'static> Debouncer<T> {
    /// # Errors
    /// A zero delay, or no tokio runtime.
    pub fn new<F>(delay: Duration, emit: F) -> Result<Self, ConfigError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if delay.is_zero() {
            return Err(CommonError::config_field("debounce_delay", "must be greater than 0").into());
        }
        let runtime = Handle::try_current().map_err(|err| ConfigError::NoRuntime(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(DebounceInner {
                delay,
                emit: Arc::new(emit),
                state: Mutex::new(DebounceState { pending: None, generation: 0, timer: None }),
                emissions: AtomicU64::new(0),
                runtime,
            }),
        })
    }

    /// Debouncer that emits into a channel
    pub fn with_channel(delay: Duration) -> Result<(Self, mpsc::UnboundedReceiver<T>), ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let debouncer = Self::new(delay, move |value| {
            // Receiver gone means nobody is listening any more.
            let _ = tx.send(value);
        })?;
        Ok((debouncer, rx))
    }

    /// Record an event, replacing any pending one and restarting the timer
    pub fn on_event(&self, value: T) {
        let mut state = self.inner.state.lock();
        state.pending = Some(value);
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let inner: Weak<DebounceInner<T>> = Arc::downgrade(&self.inner);
        let delay = self.inner.delay;
        state.timer = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire(generation);
            }
        }));
    }

    /// Drop the pending event without emitting it
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.pending = None;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Emit the pending event now; false if nothing was pending
    pub fn flush(&self) -> bool {
        let value = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.pending.take()
        };

        match value {
            Some(value) => {
                self.inner.emissions.fetch_add(1, Ordering::Relaxed);
                (self.inner.emit)(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Debouncer<T> {
    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Values emitted so far
    pub fn emissions(&self) -> u64 {
        self.inner.emissions.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.state.lock().timer.take() {
            timer.abort();
        }
    }
}
