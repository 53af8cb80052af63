//! Caller-side handle to a request's eventual outcome

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::error::{ExecutionError, Outcome};
use crate::request::RequestId;

/// Resolves once with the request's outcome
///
/// Cloneable: coalesced submissions share one `Completion`, and every clone
/// observes the same result. If the executor is dropped before the request
/// resolves, the completion resolves with [`ExecutionError::ShutDown`].
#[derive(Clone)]
#[must_use = "a Completion does nothing unless awaited"]
pub struct Completion<T> {
    id: RequestId,
    inner: Shared<oneshot::Receiver<Outcome<T>>>,
}

impl<T: Clone> Completion<T> {
    pub(crate) fn channel(id: RequestId) -> (oneshot::Sender<Outcome<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { id, inner: rx.shared() })
    }

    /// An already-resolved completion
    pub fn ready(id: RequestId, outcome: Outcome<T>) -> Self {
        let (tx, completion) = Self::channel(id);
        // The receiver is alive inside `completion`.
        let _ = tx.send(outcome);
        completion
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// The outcome if already resolved, without waiting
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.clone().now_or_never()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<T: Clone> Future for Completion<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(Err(ExecutionError::ShutDown)))
    }
}
