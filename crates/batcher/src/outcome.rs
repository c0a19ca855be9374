use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};

use crate::error::CallError;

/// The result every waiter of a coalesced call observes.
pub type CallResult<T, E> = Result<Arc<T>, CallError<E>>;

pub(crate) type Settle<T, E> = oneshot::Sender<CallResult<T, E>>;

/// A shared handle to the eventual result of a coalesced call.
///
/// Every clone resolves to the same [`CallResult`]: a successful value is handed out as
/// the same [`Arc`], a failure as clones of the same [`CallError`].
///
/// The operation behind an `Outcome` runs on its own task, so it makes progress even if
/// nobody awaits the handle.
pub struct Outcome<T, E> {
    inner: Shared<BoxFuture<'static, CallResult<T, E>>>,
}

impl<T, E> Outcome<T, E>
where
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Creates an unsettled outcome along with the sender that settles it.
    ///
    /// Dropping the sender without sending settles the outcome with
    /// [`CallError::Cancelled`].
    pub(crate) fn deferred() -> (Settle<T, E>, Self) {
        let (sender, receiver) = oneshot::channel();
        let inner = receiver
            .unwrap_or_else(|_canceled| Err(CallError::Cancelled))
            .boxed()
            .shared();

        (sender, Self { inner })
    }
}

impl<T, E> Outcome<T, E> {
    /// Returns the result if the outcome is already settled.
    ///
    /// This does not wait, but it does pick up a result that was sent before any waiter
    /// polled the outcome.
    pub fn peek(&self) -> Option<&CallResult<T, E>> {
        if self.inner.peek().is_none() {
            // polling once stores a ready result inside the shared future
            let _ = self.inner.clone().now_or_never();
        }
        self.inner.peek()
    }

    /// Whether the outcome is already settled.
    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }

    /// Whether both handles refer to the same coalesced call.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.inner.ptr_eq(&other.inner)
    }
}

impl<T, E> Clone for Outcome<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> Future for Outcome<T, E> {
    type Output = CallResult<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T, E> fmt::Debug for Outcome<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("settled", &self.is_settled())
            .finish()
    }
}
