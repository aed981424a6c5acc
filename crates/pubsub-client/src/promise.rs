// Single-resolution promise.
//
// A `Completer` is consumed by `complete`, so a value can be delivered at most
// once. If the completer is dropped unresolved, the promise yields `None`.
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Create a linked completer/promise pair.
///
/// ```
/// # tokio_test_block(async {
/// let (completer, promise) = pubsub_client::promise::channel();
/// completer.complete(7);
/// assert_eq!(promise.await, Some(7));
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
pub fn channel<T>() -> (Completer<T>, Promise<T>) {
    let (tx, rx) = oneshot::channel();
    (Completer { tx }, Promise { rx })
}

#[derive(Debug)]
pub struct Completer<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completer<T> {
    /// Resolve the promise. Returns `false` when nobody is waiting any more.
    pub fn complete(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

#[derive(Debug)]
pub struct Promise<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Promise<T> {
    /// An already resolved promise.
    pub fn ready(value: T) -> Self {
        let (completer, promise) = channel();
        completer.complete(value);
        promise
    }
}

impl<T> Future for Promise<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(Result::ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_once() {
        let (completer, promise) = channel();
        assert!(completer.complete("done"));
        assert_eq!(promise.await, Some("done"));
    }

    #[tokio::test]
    async fn dropped_completer_yields_none() {
        let (completer, promise) = channel::<u32>();
        drop(completer);
        assert_eq!(promise.await, None);
    }

    #[test]
    fn completing_after_promise_dropped_reports_nobody_waiting() {
        let (completer, promise) = channel::<u32>();
        drop(promise);
        assert!(!completer.complete(1));
    }

    #[tokio::test]
    async fn ready_promise_resolves_immediately() {
        assert_eq!(Promise::ready(3).await, Some(3));
    }
}
