//! Leading- or trailing-edge throttler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tideguard_common::{Clock, CommonError, TokioClock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Emitter;
use crate::config::{ConfigError, ThrottleEdge};

struct ThrottleState<T> {
    last_emit: Option<Instant>,
    /// Trailing edge: latest value of the current interval
    slot: Option<T>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct ThrottleInner<T> {
    interval: Duration,
    edge: ThrottleEdge,
    emit: Emitter<T>,
    state: Mutex<ThrottleState<T>>,
    emissions: AtomicU64,
    dropped: AtomicU64,
    runtime: Handle,
}

impl<T> ThrottleInner<T> {
    fn deliver(&self, value: T) {
        self.emissions.fetch_add(1, Ordering::Relaxed);
        (self.emit)(value);
    }

    fn fire(&self, generation: u64) {
        let value = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            let value = state.slot.take();
            if value.is_some() {
                state.last_emit = Some(TokioClock.now());
            }
            value
        };

        if let Some(value) = value {
            self.deliver(value);
        }
    }
}

/// At most one emission per `interval`
///
/// Leading edge emits the first event of an interval immediately and drops
/// the rest. Trailing edge keeps only the latest event of an interval and
/// emits it when the interval ends. Values are dropped, never queued.
pub struct Throttler<T> {
    inner: Arc<ThrottleInner<T>>,
}

impl<T: Send + 'static> Throttler<T> {
    /// # Errors
    /// A zero interval, or no tokio runtime.
    pub fn new<F>(interval: Duration, edge: ThrottleEdge, emit: F) -> Result<Self, ConfigError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            return Err(CommonError::config_field("throttle_interval", "must be greater than 0").into());
        }
        let runtime = Handle::try_current().map_err(|err| ConfigError::NoRuntime(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(ThrottleInner {
                interval,
                edge,
                emit: Arc::new(emit),
                state: Mutex::new(ThrottleState {
                    last_emit: None,
                    slot: None,
                    timer: None,
                    generation: 0,
                }),
                emissions: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                runtime,
            }),
        })
    }

    /// Throttler that emits into a channel
    pub fn with_channel(
        interval: Duration,
        edge: ThrottleEdge,
    ) -> Result<(Self, mpsc::UnboundedReceiver<T>), ConfigError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let throttler = Self::new(interval, edge, move |value| {
            let _ = tx.send(value);
        })?;
        Ok((throttler, rx))
    }

    pub fn on_event(&self, value: T) {
        match self.inner.edge {
            ThrottleEdge::Leading => self.on_leading(value),
            ThrottleEdge::Trailing => self.on_trailing(value),
        }
    }

    fn on_leading(&self, value: T) {
        let now = TokioClock.now();
        let open = {
            let mut state = self.inner.state.lock();
            let open = state
                .last_emit
                .map_or(true, |last| now.saturating_duration_since(last) >= self.inner.interval);
            if open {
                state.last_emit = Some(now);
            }
            open
        };

        if open {
            self.inner.deliver(value);
        } else {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn on_trailing(&self, value: T) {
        let mut state = self.inner.state.lock();
        if state.slot.replace(value).is_some() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        if state.timer.is_some() {
            return;
        }

        let generation = state.generation;
        let inner = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        state.timer = Some(self.inner.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = inner.upgrade() {
                inner.fire(generation);
            }
        }));
    }

    /// Drop the pending trailing value without emitting it
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.slot = None;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Emit the pending trailing value now; false if nothing was pending
    pub fn flush(&self) -> bool {
        let value = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let value = state.slot.take();
            if value.is_some() {
                state.last_emit = Some(TokioClock.now());
            }
            value
        };

        match value {
            Some(value) => {
                self.inner.deliver(value);
                true
            }
            None => false,
        }
    }
}

impl<T> Throttler<T> {
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    pub fn edge(&self) -> ThrottleEdge {
        self.inner.edge
    }

    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().slot.is_some()
    }

    pub fn emissions(&self) -> u64 {
        self.inner.emissions.load(Ordering::Relaxed)
    }

    /// Events discarded by the throttle
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Throttler<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.state.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Leading edge: first event emits, the rest of the interval is dropped.
    #[tokio::test(start_paused = true)]
    async fn test_leading_edge() {
        let (throttler, mut rx) =
            Throttler::with_channel(Duration::from_millis(100), ThrottleEdge::Leading).expect("runtime");

        for value in 0..5 {
            throttler.on_event(value);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        // t = 150ms: events at 0 and 120 emitted
        assert_eq!(rx.try_recv().ok(), Some(0));
        assert_eq!(rx.try_recv().ok(), Some(4));
        assert!(rx.try_recv().is_err());
        assert_eq!(throttler.emissions(), 2);
        assert_eq!(throttler.dropped(), 3);
        assert!(!throttler.is_pending());
    }

    /// Trailing edge: the latest event is emitted at the interval boundary.
    #[tokio::test(start_paused = true)]
    async fn test_trailing_edge() {
        let (throttler, mut rx) =
            Throttler::with_channel(Duration::from_millis(100), ThrottleEdge::Trailing).expect("runtime");

        throttler.on_event("a");
        throttler.on_event("b");
        throttler.on_event("c");
        assert!(throttler.is_pending());
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(rx.try_recv().ok(), Some("c"));
        assert!(rx.try_recv().is_err());
        assert_eq!(throttler.dropped(), 2);

        throttler.on_event("d");
        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(rx.try_recv().ok(), Some("d"));
        assert_eq!(throttler.emissions(), 2);
    }

    /// Reset drops the trailing value; flush emits it now.
    #[tokio::test(start_paused = true)]
    async fn test_trailing_reset_and_flush() {
        let (throttler, mut rx) =
            Throttler::with_channel(Duration::from_millis(100), ThrottleEdge::Trailing).expect("runtime");

        throttler.on_event(1);
        throttler.reset();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());

        throttler.on_event(2);
        assert!(throttler.flush());
        assert_eq!(rx.try_recv().ok(), Some(2));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    /// A zero interval is rejected.
    #[tokio::test]
    async fn test_zero_interval_rejected() {
        assert!(Throttler::<u8>::with_channel(Duration::ZERO, ThrottleEdge::Leading).is_err());
    }
}
