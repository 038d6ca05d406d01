//! Single-assignment futures (spec.md §2's "Promise / Deferred").
//!
//! A `Deferred<T, E>` is resolved or failed exactly once by the owning
//! state machine; the paired `Promise<T, E>` is the `Future` the caller
//! awaits. Built on `tokio::sync::oneshot`, which already enforces
//! single-assignment semantics at the channel level.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

/// Gives an error enum a dedicated variant for "this operation was
/// abandoned before it settled", so a dropped [`Deferred`] can report that
/// through the normal `Result` channel instead of leaving the paired
/// [`Promise`] to fail on the oneshot channel's own disconnect error.
pub trait Cancellable {
    fn cancelled() -> Self;
}

/// The resolving half of a single-assignment future.
///
/// Dropping a `Deferred` without calling `resolve`/`fail` (the owning
/// `Encryptor`/`SocketPool`/`Client` torn down while a `HandshakeRecord` or
/// queued `Waiter` still holds one) settles the paired `Promise` with
/// `E::cancelled()` instead.
pub struct Deferred<T, E: Cancellable> {
    sender: Option<oneshot::Sender<Result<T, E>>>,
}

/// The awaiting half of a single-assignment future.
pub struct Promise<T, E: Cancellable> {
    receiver: oneshot::Receiver<Result<T, E>>,
}

/// Creates a linked `Deferred`/`Promise` pair.
pub fn deferred<T, E: Cancellable>() -> (Deferred<T, E>, Promise<T, E>) {
    let (tx, rx) = oneshot::channel();
    (
        Deferred { sender: Some(tx) },
        Promise { receiver: rx },
    )
}

impl<T, E: Cancellable> Deferred<T, E> {
    /// Settles the paired `Promise` with a success value. A no-op if
    /// already settled (only the first `resolve`/`fail` call has effect,
    /// matching invariant E-2: "resolved exactly once").
    pub fn resolve(&mut self, value: T) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Ok(value));
        }
    }

    /// Settles the paired `Promise` with a failure.
    pub fn fail(&mut self, error: E) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(error));
        }
    }

    /// Whether this `Deferred` has already been settled.
    pub fn is_settled(&self) -> bool {
        self.sender.is_none()
    }
}

impl<T, E: Cancellable> Drop for Deferred<T, E> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Err(E::cancelled()));
        }
    }
}

impl<T, E: Cancellable> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // `Deferred::drop` always sends `E::cancelled()` before the
            // sender goes away, so this arm is unreachable in practice;
            // map it to the same typed error rather than panicking, since
            // teardown is a valid path, not a bug.
            Poll::Ready(Err(_)) => Poll::Ready(Err(E::cancelled())),
            Poll::Pending => Poll::Pending,
        }
    }
}
