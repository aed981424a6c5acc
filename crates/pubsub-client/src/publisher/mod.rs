// Publish pipeline: admission, per-key batching, alarm flushing and submission.
//
// A message travels admission -> accumulator -> (threshold or alarm) -> wire
// and its `PublishFuture` resolves exactly once with the server id or an error.
// Keyed batches go through the sequential executor so a key never has two
// publish calls in flight; unordered batches are spawned directly.
mod batch;

use crate::config::PublisherConfig;
use crate::error::{ConfigError, PublishError};
use crate::flow_control::FlowController;
use crate::promise::{self, Promise};
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::sequential::{FailurePolicy, SequentialError, SequentialExecutor};
use crate::waiter::Waiter;
use batch::{MessagesBatch, OutstandingBatch, OutstandingPublish, PublishCompleter, ReadyBatches};
use parking_lot::Mutex;
use pubsub_wire::{PublishRequest, PublishResponse, PublisherTransport, PubsubMessage, Status};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Resolves to the server-assigned message id, or why the message was not published.
#[derive(Debug)]
pub struct PublishFuture {
    promise: Promise<Result<String, PublishError>>,
}

impl PublishFuture {
    fn failed(err: PublishError) -> Self {
        Self {
            promise: Promise::ready(Err(err)),
        }
    }
}

impl Future for PublishFuture {
    type Output = Result<String, PublishError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or(Err(PublishError::Dropped)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub messages_published: u64,
    pub messages_failed: u64,
    pub batches_sent: u64,
    /// Admitted messages whose future has not resolved yet.
    pub outstanding_messages: usize,
}

#[derive(Default)]
struct PublishCounters {
    published: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

#[derive(Default)]
struct PublisherState {
    shutdown: bool,
    /// Open batches by ordering key; `""` is the unordered group. Empty batches are removed.
    batches: HashMap<String, MessagesBatch>,
    alarm: Option<ScheduledTask>,
}

/// Completion half of an outstanding publish once its message went on the wire.
struct PendingPublish {
    size: usize,
    done: PublishCompleter,
}

#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    topic: String,
    /// Encoded size of a publish request before any message is added.
    request_base_bytes: usize,
    config: PublisherConfig,
    transport: Arc<dyn PublisherTransport>,
    scheduler: Scheduler,
    flow_controller: FlowController,
    sequential: SequentialExecutor,
    state: Mutex<PublisherState>,
    outstanding: Waiter,
    counters: PublishCounters,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.inner.topic)
            .field("ordering", &self.inner.config.enable_message_ordering)
            .finish()
    }
}

impl Publisher {
    pub fn new(
        topic: impl Into<String>,
        config: PublisherConfig,
        transport: Arc<dyn PublisherTransport>,
        scheduler: Scheduler,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let topic = topic.into();
        if topic.is_empty() {
            return Err(ConfigError::invalid("topic", "must not be empty"));
        }
        let flow_controller = FlowController::new(&config.flow_control);
        let sequential = SequentialExecutor::new(scheduler.clone(), FailurePolicy::PauseKey);
        debug!(
            topic = %topic,
            ordering = config.enable_message_ordering,
            element_count_threshold = config.batching.element_count_threshold,
            request_byte_threshold = config.batching.request_byte_threshold,
            "publisher created"
        );
        Ok(Self {
            inner: Arc::new(PublisherInner {
                request_base_bytes: PublishRequest::base_len(&topic),
                topic,
                config,
                transport,
                scheduler,
                flow_controller,
                sequential,
                state: Mutex::new(PublisherState::default()),
                outstanding: Waiter::new(),
                counters: PublishCounters::default(),
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Admit `message` for publishing.
    ///
    /// Waits only while flow control is blocking; every other failure is
    /// reported through the returned future.
    pub async fn publish(&self, message: PubsubMessage) -> PublishFuture {
        let inner = &self.inner;
        let key = message.ordering_key.clone();
        if inner.state.lock().shutdown {
            return PublishFuture::failed(PublishError::Shutdown);
        }
        if !key.is_empty() {
            if !inner.config.enable_message_ordering {
                return PublishFuture::failed(PublishError::OrderingDisabled);
            }
            if inner.sequential.is_paused(&key) {
                return PublishFuture::failed(PublishError::KeyPaused { key });
            }
        }

        let (done, promise) = promise::channel();
        let item = OutstandingPublish::new(message, done);
        if let Err(err) = inner.flow_controller.acquire(item.size as u64).await {
            if !key.is_empty() {
                // Later messages for this key must not overtake the rejected one.
                inner.sequential.pause(&key);
            }
            debug!(topic = %inner.topic, ordering_key = %key, error = %err, "publish rejected by flow control");
            t_counter!("pubsub_publish_messages_total", "result" => "flow_control").increment(1);
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
            item.done.complete(Err(err.into()));
            return PublishFuture { promise };
        }

        let mut unordered = ReadyBatches::new();
        {
            let mut state = inner.state.lock();
            let rejection = if state.shutdown {
                Some(PublishError::Shutdown)
            } else if !key.is_empty() && inner.sequential.is_paused(&key) {
                Some(PublishError::KeyPaused { key: key.clone() })
            } else {
                None
            };
            if let Some(err) = rejection {
                drop(state);
                inner.flow_controller.release(item.size as u64);
                item.done.complete(Err(err));
                return PublishFuture { promise };
            }

            inner.outstanding.increment(1);
            trace!(topic = %inner.topic, ordering_key = %key, bytes = item.size, "message admitted");
            let batch = state.batches.entry(key.clone()).or_insert_with(|| {
                MessagesBatch::new(key.clone(), &inner.config.batching, inner.request_base_bytes)
            });
            let ready = batch.add(item);
            if batch.is_empty() {
                state.batches.remove(&key);
            }
            if key.is_empty() {
                unordered = ready;
            } else {
                // Submitting under the lock keeps concurrent publishers in order.
                for batch in ready {
                    inner.submit_batch(batch);
                }
            }
            inner.arm_alarm(&mut state);
        }
        for batch in unordered {
            inner.submit_batch(batch);
        }
        PublishFuture { promise }
    }

    /// Accept publishes for `key` again after a failure paused it.
    pub fn resume_publish(&self, key: &str) {
        debug!(topic = %self.inner.topic, ordering_key = %key, "resuming ordering key");
        self.inner.sequential.resume(key);
    }

    /// Send every open batch now and wait until those batches are done.
    pub async fn flush(&self) {
        let handles = self.inner.publish_all_outstanding();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop accepting messages, flush, and wait for every admitted message to resolve.
    pub async fn shutdown(&self) -> Result<(), PublishError> {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(PublishError::Shutdown);
            }
            state.shutdown = true;
        }
        debug!(
            topic = %self.inner.topic,
            outstanding = self.inner.outstanding.pending_count(),
            "publisher shutting down"
        );
        self.inner.publish_all_outstanding();
        self.inner.outstanding.wait_complete().await;
        debug!(topic = %self.inner.topic, "publisher shut down");
        Ok(())
    }

    /// Wait at most `timeout` for outstanding messages; true when none remain.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        self.inner.outstanding.try_wait(timeout).await
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    pub fn stats(&self) -> PublisherStats {
        let counters = &self.inner.counters;
        PublisherStats {
            messages_published: counters.published.load(Ordering::Relaxed),
            messages_failed: counters.failed.load(Ordering::Relaxed),
            batches_sent: counters.batches.load(Ordering::Relaxed),
            outstanding_messages: self.inner.outstanding.pending_count(),
        }
    }
}

impl PublisherInner {
    fn arm_alarm(self: &Arc<Self>, state: &mut PublisherState) {
        if state.alarm.is_some() || state.batches.values().all(MessagesBatch::is_empty) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        state.alarm = Some(self.scheduler.schedule_once(
            self.config.batching.delay_threshold,
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.flush_on_alarm();
                }
            },
        ));
    }

    /// Flush every batch whose key has nothing in flight; re-arm for the rest.
    fn flush_on_alarm(self: &Arc<Self>) {
        let mut unordered = Vec::new();
        {
            let mut state = self.state.lock();
            state.alarm = None;
            let mut deferred = false;
            for (key, batch) in state.batches.iter_mut() {
                if batch.is_empty() {
                    continue;
                }
                if key.is_empty() {
                    unordered.push(batch.pop_outstanding_batch());
                } else if self.sequential.has_tasks_inflight(key) {
                    deferred = true;
                } else {
                    self.submit_batch(batch.pop_outstanding_batch());
                }
            }
            state.batches.retain(|_, batch| !batch.is_empty());
            if deferred {
                self.arm_alarm(&mut state);
            }
        }
        for batch in unordered {
            self.submit_batch(batch);
        }
    }

    fn publish_all_outstanding(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let mut unordered = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(alarm) = state.alarm.take() {
                alarm.cancel();
            }
            for (key, mut batch) in state.batches.drain() {
                if batch.is_empty() {
                    continue;
                }
                let popped = batch.pop_outstanding_batch();
                if key.is_empty() {
                    unordered.push(popped);
                } else {
                    handles.push(self.submit_batch(popped));
                }
            }
        }
        handles.extend(unordered.into_iter().map(|batch| self.submit_batch(batch)));
        handles
    }

    /// Hand a popped batch to the wire. The handle finishes once every message
    /// in the batch has resolved.
    fn submit_batch(self: &Arc<Self>, batch: OutstandingBatch) -> JoinHandle<()> {
        let count = batch.len();
        let OutstandingBatch {
            ordering_key,
            messages,
            batch_bytes,
            created_at,
        } = batch;
        let mut wire = Vec::with_capacity(count);
        let mut pending = Vec::with_capacity(count);
        for item in messages {
            wire.push(item.message);
            pending.push(PendingPublish {
                size: item.size,
                done: item.done,
            });
        }
        debug!(
            topic = %self.topic,
            ordering_key = %ordering_key,
            messages = count,
            bytes = batch_bytes,
            waited_ms = created_at.elapsed().as_millis() as u64,
            "submitting publish batch"
        );

        if ordering_key.is_empty() {
            let inner = Arc::clone(self);
            return self.scheduler.spawn(async move {
                let outcome = inner.send_with_retries(wire).await.map_err(PublishError::Rpc);
                inner.complete_batch(pending, outcome);
            });
        }

        let sender = Arc::clone(self);
        let sent = self.sequential.submit(&ordering_key, move || async move {
            sender.send_with_retries(wire).await
        });
        let inner = Arc::clone(self);
        self.scheduler.spawn(async move {
            match sent.await {
                Some(Ok(response)) => inner.complete_batch(pending, Ok(response)),
                Some(Err(SequentialError::Failed(status))) => {
                    warn!(
                        topic = %inner.topic,
                        ordering_key = %ordering_key,
                        error = %status,
                        "ordered publish failed; pausing key"
                    );
                    inner.complete_batch(pending, Err(PublishError::Rpc(status)));
                    inner.cancel_open_batch(&ordering_key);
                }
                Some(Err(SequentialError::Cancelled)) => inner.complete_batch(
                    pending,
                    Err(PublishError::Cancelled {
                        key: ordering_key.clone(),
                    }),
                ),
                // Its messages were admitted before the failure paused the key.
                Some(Err(SequentialError::KeyPaused)) => inner.complete_batch(
                    pending,
                    Err(PublishError::Cancelled {
                        key: ordering_key.clone(),
                    }),
                ),
                None => inner.complete_batch(pending, Err(PublishError::Dropped)),
            }
        })
    }

    /// Fail the not-yet-sent messages of a key whose earlier batch failed.
    fn cancel_open_batch(&self, key: &str) {
        let drained = match self.state.lock().batches.remove(key) {
            Some(mut batch) => batch.drain(),
            None => return,
        };
        if drained.is_empty() {
            return;
        }
        debug!(topic = %self.topic, ordering_key = %key, cancelled = drained.len(), "cancelling open batch");
        let pending = drained
            .into_iter()
            .map(|item| PendingPublish {
                size: item.size,
                done: item.done,
            })
            .collect();
        self.complete_batch(
            pending,
            Err(PublishError::Cancelled {
                key: key.to_string(),
            }),
        );
    }

    /// Publish with backoff on retryable statuses.
    ///
    /// Ordered publishers never give up: dropping one message would either
    /// stall or reorder its key.
    async fn send_with_retries(
        &self,
        messages: Vec<PubsubMessage>,
    ) -> Result<PublishResponse, Status> {
        let retry = &self.config.retry;
        let unlimited = self.config.enable_message_ordering;
        let request = PublishRequest {
            topic: self.topic.clone(),
            messages,
        };
        let deadline = Instant::now() + retry.total_timeout;
        let mut delay = retry.initial_retry_delay;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            let result = self.transport.publish(request.clone()).await;
            t_histogram!("pubsub_publish_rpc_duration_seconds").record(start.elapsed().as_secs_f64());
            let status = match result {
                Ok(response) => {
                    t_counter!("pubsub_publish_batches_total", "result" => "ok").increment(1);
                    return Ok(response);
                }
                Err(status) => status,
            };
            let attempts_left = retry.max_attempts == 0 || attempt < retry.max_attempts;
            let time_left = Instant::now() + delay < deadline;
            if !status.is_retryable() || (!unlimited && !(attempts_left && time_left)) {
                t_counter!("pubsub_publish_batches_total", "result" => "error").increment(1);
                warn!(
                    topic = %self.topic,
                    attempt,
                    messages = request.messages.len(),
                    error = %status,
                    "publish failed"
                );
                return Err(status);
            }
            debug!(
                topic = %self.topic,
                attempt,
                backoff_ms = delay.as_millis() as u64,
                error = %status,
                "retrying publish"
            );
            tokio::time::sleep(delay).await;
            delay = crate::next_backoff(delay, retry.retry_delay_multiplier, retry.max_retry_delay);
        }
    }

    fn complete_batch(
        &self,
        pending: Vec<PendingPublish>,
        outcome: Result<PublishResponse, PublishError>,
    ) {
        let count = pending.len();
        for item in &pending {
            self.flow_controller.release(item.size as u64);
        }
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(response) if response.message_ids.len() == count => {
                for (item, id) in pending.into_iter().zip(response.message_ids) {
                    item.done.complete(Ok(id));
                }
                self.counters
                    .published
                    .fetch_add(count as u64, Ordering::Relaxed);
                t_counter!("pubsub_publish_messages_total", "result" => "ok").increment(count as u64);
            }
            Ok(response) => {
                let err = PublishError::IdCountMismatch {
                    expected: count,
                    received: response.message_ids.len(),
                };
                warn!(topic = %self.topic, error = %err, "publish response malformed");
                self.fail_all(pending, err);
            }
            Err(err) => self.fail_all(pending, err),
        }
        self.outstanding.decrement(count);
    }

    fn fail_all(&self, pending: Vec<PendingPublish>, err: PublishError) {
        let count = pending.len() as u64;
        for item in pending {
            item.done.complete(Err(err.clone()));
        }
        self.counters.failed.fetch_add(count, Ordering::Relaxed);
        t_counter!("pubsub_publish_messages_total", "result" => "error").increment(count);
    }
}
