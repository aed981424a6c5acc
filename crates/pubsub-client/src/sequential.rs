//! Per-key FIFO executor.
//!
//! # Purpose
//! Work submitted under the same key runs strictly in submission order, one
//! unit at a time. Distinct keys proceed independently on the shared runtime.
//! The publisher uses this to keep ordered batches in order across retries; the
//! subscriber uses it to deliver ordered messages one after another.
//!
//! # Design notes
//! - Each active key has a queue and at most one driver task. The driver pops
//!   the next unit only after the previous one has fully completed.
//! - Under [`FailurePolicy::PauseKey`] a unit returning `Err` pauses its key:
//!   everything still queued is resolved with [`SequentialError::Cancelled`] and
//!   later submissions get [`SequentialError::KeyPaused`] until
//!   [`SequentialExecutor::resume`]. The pause is recorded before the failing
//!   unit's own promise resolves, so nothing can slip in behind it.
use crate::promise::{self, Completer, Promise};
use crate::scheduler::Scheduler;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// A failed unit pauses its key and cancels the queue behind it.
    PauseKey,
    /// Failures are reported but the key keeps going.
    Continue,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SequentialError<E> {
    #[error("task failed: {0}")]
    Failed(E),
    #[error("cancelled after an earlier task for the same key failed")]
    Cancelled,
    #[error("key is paused after a prior failure")]
    KeyPaused,
}

pub type SequentialResult<T, E> = Result<T, SequentialError<E>>;

struct Finished {
    failed: bool,
    deliver: Box<dyn FnOnce() + Send>,
}

trait Job: Send {
    fn run(self: Box<Self>) -> BoxFuture<'static, Finished>;
    fn resolve_early(self: Box<Self>, reason: EarlyExit);
}

#[derive(Clone, Copy)]
enum EarlyExit {
    Cancelled,
    KeyPaused,
}

struct TypedJob<F, T, E> {
    task: F,
    done: Completer<SequentialResult<T, E>>,
}

impl<F, Fut, T, E> Job for TypedJob<F, T, E>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn run(self: Box<Self>) -> BoxFuture<'static, Finished> {
        let TypedJob { task, done } = *self;
        Box::pin(async move {
            match task().await {
                Ok(value) => Finished {
                    failed: false,
                    deliver: Box::new(move || {
                        done.complete(Ok(value));
                    }),
                },
                Err(err) => Finished {
                    failed: true,
                    deliver: Box::new(move || {
                        done.complete(Err(SequentialError::Failed(err)));
                    }),
                },
            }
        })
    }

    fn resolve_early(self: Box<Self>, reason: EarlyExit) {
        let err = match reason {
            EarlyExit::Cancelled => SequentialError::Cancelled,
            EarlyExit::KeyPaused => SequentialError::KeyPaused,
        };
        self.done.complete(Err(err));
    }
}

#[derive(Default)]
struct KeyQueue {
    running: bool,
    paused: bool,
    pending: VecDeque<Box<dyn Job>>,
}

struct Inner {
    scheduler: Scheduler,
    policy: FailurePolicy,
    keys: Mutex<HashMap<String, KeyQueue>>,
}

#[derive(Clone)]
pub struct SequentialExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SequentialExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialExecutor")
            .field("policy", &self.inner.policy)
            .field("active_keys", &self.inner.keys.lock().len())
            .finish()
    }
}

impl SequentialExecutor {
    pub fn new(scheduler: Scheduler, policy: FailurePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                policy,
                keys: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue `task` behind every earlier task for `key`.
    pub fn submit<F, Fut, T, E>(&self, key: &str, task: F) -> Promise<SequentialResult<T, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (done, promise) = promise::channel();
        let job: Box<dyn Job> = Box::new(TypedJob { task, done });

        let start = {
            let mut keys = self.inner.keys.lock();
            let queue = keys.entry(key.to_string()).or_default();
            if queue.paused {
                drop(keys);
                job.resolve_early(EarlyExit::KeyPaused);
                return promise;
            }
            if queue.running {
                queue.pending.push_back(job);
                None
            } else {
                queue.running = true;
                Some(job)
            }
        };

        if let Some(job) = start {
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            self.inner.scheduler.spawn(drive(inner, key, job));
        }
        promise
    }

    /// Refuse new submissions for `key` without touching what is already queued.
    pub fn pause(&self, key: &str) {
        self.inner.keys.lock().entry(key.to_string()).or_default().paused = true;
    }

    /// Lift a pause so new submissions for `key` are accepted again.
    pub fn resume(&self, key: &str) {
        let mut keys = self.inner.keys.lock();
        if let Some(queue) = keys.get_mut(key) {
            queue.paused = false;
            if !queue.running && queue.pending.is_empty() {
                keys.remove(key);
            }
        }
    }

    pub fn is_paused(&self, key: &str) -> bool {
        self.inner
            .keys
            .lock()
            .get(key)
            .is_some_and(|queue| queue.paused)
    }

    /// True while `key` has a task running or queued.
    pub fn has_tasks_inflight(&self, key: &str) -> bool {
        self.inner
            .keys
            .lock()
            .get(key)
            .is_some_and(|queue| queue.running || !queue.pending.is_empty())
    }
}

async fn drive(inner: Arc<Inner>, key: String, first: Box<dyn Job>) {
    let mut job = first;
    loop {
        let finished = match AssertUnwindSafe(job.run()).catch_unwind().await {
            Ok(finished) => finished,
            Err(_) => {
                warn!(key = %key, "sequential task panicked");
                Finished {
                    failed: true,
                    deliver: Box::new(|| {}),
                }
            }
        };

        let mut cancelled = Vec::new();
        let next = {
            let mut keys = inner.keys.lock();
            let queue = keys.entry(key.clone()).or_default();
            if finished.failed && inner.policy == FailurePolicy::PauseKey {
                queue.paused = true;
                cancelled.extend(queue.pending.drain(..));
            }
            match queue.pending.pop_front() {
                Some(next) => Some(next),
                None => {
                    queue.running = false;
                    if !queue.paused {
                        keys.remove(&key);
                    }
                    None
                }
            }
        };

        if !cancelled.is_empty() {
            debug!(key = %key, cancelled = cancelled.len(), "key paused; cancelling queued tasks");
        }
        for job in cancelled {
            job.resolve_early(EarlyExit::Cancelled);
        }
        (finished.deliver)();

        match next {
            Some(next) => job = next,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn executor(policy: FailurePolicy) -> SequentialExecutor {
        SequentialExecutor::new(Scheduler::current().expect("runtime"), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_runs_in_order_without_overlap() {
        let executor = executor(FailurePolicy::PauseKey);
        let log = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));
        let mut promises = Vec::new();
        for id in 0..5u64 {
            let log = Arc::clone(&log);
            let running = Arc::clone(&running);
            promises.push(executor.submit("k", move || async move {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                // Later tasks finish faster; order must still hold.
                tokio::time::sleep(Duration::from_millis(50 - id * 10)).await;
                log.lock().push(id);
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<u64, ()>(id)
            }));
        }
        for (id, promise) in promises.into_iter().enumerate() {
            assert_eq!(promise.await, Some(Ok(id as u64)));
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert!(!executor.has_tasks_inflight("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_concurrently() {
        let executor = executor(FailurePolicy::PauseKey);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut promises = Vec::new();
        for key in ["a", "b", "c"] {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            promises.push(executor.submit(key, move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), ()>(())
            }));
        }
        for promise in promises {
            assert_eq!(promise.await, Some(Ok(())));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_pauses_key_until_resumed() {
        let executor = executor(FailurePolicy::PauseKey);
        let first = executor.submit("k1", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), &str>("boom")
        });
        let second = executor.submit("k1", || async { Ok::<(), &str>(()) });
        let third = executor.submit("k1", || async { Ok::<(), &str>(()) });
        let other = executor.submit("k2", || async { Ok::<(), &str>(()) });

        assert_eq!(first.await, Some(Err(SequentialError::Failed("boom"))));
        assert_eq!(second.await, Some(Err(SequentialError::Cancelled)));
        assert_eq!(third.await, Some(Err(SequentialError::Cancelled)));
        assert_eq!(other.await, Some(Ok(())));

        assert!(executor.is_paused("k1"));
        assert!(!executor.has_tasks_inflight("k1"));
        let rejected = executor.submit("k1", || async { Ok::<(), &str>(()) });
        assert_eq!(rejected.await, Some(Err(SequentialError::KeyPaused)));

        executor.resume("k1");
        assert!(!executor.is_paused("k1"));
        let accepted = executor.submit("k1", || async { Ok::<u8, &str>(7) });
        assert_eq!(accepted.await, Some(Ok(7)));
    }

    #[tokio::test]
    async fn explicit_pause_keeps_queued_work() {
        let executor = executor(FailurePolicy::PauseKey);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = executor.submit("k", move || async move {
            let _ = release_rx.await;
            Ok::<u8, ()>(1)
        });
        let second = executor.submit("k", || async { Ok::<u8, ()>(2) });
        executor.pause("k");
        let rejected = executor.submit("k", || async { Ok::<u8, ()>(3) });
        assert_eq!(rejected.await, Some(Err(SequentialError::KeyPaused)));

        let _ = release_tx.send(());
        assert_eq!(first.await, Some(Ok(1)));
        assert_eq!(second.await, Some(Ok(2)));
        assert!(executor.is_paused("k"));
    }

    #[tokio::test]
    async fn continue_policy_keeps_key_open() {
        let executor = executor(FailurePolicy::Continue);
        let first = executor.submit("k", || async { Err::<(), &str>("ignored") });
        let second = executor.submit("k", || async { Ok::<(), &str>(()) });
        assert_eq!(first.await, Some(Err(SequentialError::Failed("ignored"))));
        assert_eq!(second.await, Some(Ok(())));
        assert!(!executor.is_paused("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_tracks_running_and_queued_tasks() {
        let executor = executor(FailurePolicy::PauseKey);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let running = executor.submit("k", move || async move {
            let _ = release_rx.await;
            Ok::<(), ()>(())
        });
        tokio::task::yield_now().await;
        assert!(executor.has_tasks_inflight("k"));
        assert!(!executor.has_tasks_inflight("other"));

        let _ = release_tx.send(());
        assert_eq!(running.await, Some(Ok(())));
        tokio::task::yield_now().await;
        assert!(!executor.has_tasks_inflight("k"));
    }

    #[tokio::test]
    async fn panicking_task_pauses_key_instead_of_wedging_it() {
        let executor = executor(FailurePolicy::PauseKey);
        let panicked = executor.submit("k", || async {
            if true {
                panic!("task blew up");
            }
            Ok::<(), ()>(())
        });
        // The completer went down with the task.
        assert_eq!(panicked.await, None);
        tokio::task::yield_now().await;
        assert!(executor.is_paused("k"));
        assert!(!executor.has_tasks_inflight("k"));
    }
}
