// Pending-work counter that lets shutdown paths wait for zero.
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
pub(crate) struct Waiter {
    pending: watch::Sender<usize>,
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Waiter {
    pub(crate) fn new() -> Self {
        let (pending, _) = watch::channel(0);
        Self { pending }
    }

    pub(crate) fn increment(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.pending.send_modify(|pending| *pending += count);
    }

    pub(crate) fn decrement(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(count));
    }

    pub(crate) fn pending_count(&self) -> usize {
        *self.pending.borrow()
    }

    pub(crate) async fn wait_complete(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// Wait at most `timeout`; true when the count reached zero in time.
    pub(crate) async fn try_wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_complete())
            .await
            .is_ok()
    }
}
