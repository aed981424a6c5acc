//! Injected scheduling capability.
//!
//! # Purpose
//! Components that need periodic ticks or delayed work (the publish flush alarm,
//! the dispatcher's lease tick, reconnect backoff) receive a [`Scheduler`] at
//! construction instead of reaching for a global executor. Every scheduled unit
//! returns a [`ScheduledTask`] handle so the owner cancels exactly what it
//! started.
//!
//! # Design notes
//! - Periodic bodies return `anyhow::Result<()>`. An `Err` or a panic inside one
//!   run is logged and the next run still happens.
//! - Dropping a `ScheduledTask` cancels it. Cancellation is cooperative: a body
//!   already running finishes its current await point before observing it.
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime the caller is running on.
    pub fn current() -> anyhow::Result<Self> {
        let handle = Handle::try_current()
            .map_err(|err| anyhow::anyhow!("no tokio runtime available: {err}"))?;
        Ok(Self::new(handle))
    }

    /// Spawn a one-off unit of work on the shared runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run `task` every `period`, first run one period from now.
    pub fn schedule_repeating<F, Fut>(
        &self,
        name: &'static str,
        period: Duration,
        mut task: F,
    ) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = self.handle.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match AssertUnwindSafe(task()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(task = name, error = %err, "periodic task failed"),
                    Err(_) => warn!(task = name, "periodic task panicked"),
                }
            }
        });
        ScheduledTask { token, handle }
    }

    /// Run `future` once after `delay` unless cancelled first.
    pub fn schedule_once<F>(&self, delay: Duration, future: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = self.handle.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => future.await,
            }
        });
        ScheduledTask { token, handle }
    }
}

/// Handle to a scheduled unit of work. Dropping it cancels the work.
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the task to observe it.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
