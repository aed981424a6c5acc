// One streaming pull: the read loop feeding a dispatcher, plus the unary
// ack/modack sender its dispatcher drains into.
//
// The stream runs with manual credit. One response is requested at a time and
// the next request only goes out after the dispatcher has leased every message
// of the previous one, so at most one undelivered response is ever buffered.
use super::ack::{AckOperation, AckRequest, AckResponse};
use super::dispatcher::{AckProcessor, DispatchShared, Dispatcher, DispatcherStats};
use crate::scheduler::Scheduler;
use crate::waiter::Waiter;
use parking_lot::Mutex;
use pubsub_wire::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PullStream, Status, StreamingPullRequest,
    SubscriberTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const BACKOFF_MULTIPLIER: f64 = 2.0;

const TRANSIENT_FAILURE_PREFIX: &str = "TRANSIENT_";
const INVALID_ACK_ID: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";

/// Sends ack operations as unary RPCs on spawned tasks.
#[derive(Clone)]
pub(crate) struct AckSender {
    inner: Arc<AckSenderInner>,
}

struct AckSenderInner {
    subscription: String,
    transport: Arc<dyn SubscriberTransport>,
    retry_timeout: Duration,
    scheduler: Scheduler,
    in_flight: Waiter,
}

impl AckSender {
    pub(crate) fn new(
        subscription: String,
        transport: Arc<dyn SubscriberTransport>,
        retry_timeout: Duration,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            inner: Arc::new(AckSenderInner {
                subscription,
                transport,
                retry_timeout,
                scheduler,
                in_flight: Waiter::new(),
            }),
        }
    }

    /// Resolves once every operation handed to `send` so far has finished.
    pub(crate) async fn wait_idle(&self) {
        self.inner.in_flight.wait_complete().await;
    }
}

impl AckProcessor for AckSender {
    fn send(&self, operation: AckOperation, exactly_once: bool) {
        self.inner.in_flight.increment(1);
        let inner = Arc::clone(&self.inner);
        self.inner.scheduler.spawn(async move {
            inner.execute(operation, exactly_once).await;
            inner.in_flight.decrement(1);
        });
    }
}

impl AckSenderInner {
    async fn execute(&self, operation: AckOperation, exactly_once: bool) {
        let kind = operation.kind();
        let (deadline_seconds, mut requests) = match operation {
            AckOperation::Ack(requests) => (None, requests),
            AckOperation::Modack(modack) => (Some(modack.deadline_seconds), modack.requests),
        };
        let give_up_at = Instant::now() + self.retry_timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let ack_ids: Vec<String> = requests.iter().map(|r| r.ack_id.clone()).collect();
            let count = ack_ids.len();
            t_counter!("pubsub_ack_requests_total", "kind" => kind).increment(1);
            let status = match self.call(deadline_seconds, ack_ids).await {
                Ok(()) => {
                    trace!(kind, count, "ack operation succeeded");
                    complete_all(requests, AckResponse::Successful);
                    return;
                }
                Err(status) => status,
            };

            if !exactly_once {
                // Without exactly-once the service redelivers instead; nothing to report.
                warn!(
                    subscription = %self.subscription,
                    kind,
                    count,
                    error = %status,
                    "ack operation failed"
                );
                complete_all(requests, AckResponse::Successful);
                return;
            }

            let retry = classify_failure(&status, requests);
            if retry.is_empty() {
                return;
            }
            if Instant::now() + backoff >= give_up_at {
                warn!(
                    subscription = %self.subscription,
                    kind,
                    remaining = retry.len(),
                    error = %status,
                    "ack retry budget exhausted"
                );
                complete_all(retry, AckResponse::Other);
                return;
            }
            debug!(
                subscription = %self.subscription,
                kind,
                retrying = retry.len(),
                backoff_ms = backoff.as_millis() as u64,
                error = %status,
                "retrying ack operation"
            );
            tokio::time::sleep(backoff).await;
            backoff = crate::next_backoff(backoff, BACKOFF_MULTIPLIER, MAX_BACKOFF);
            requests = retry;
        }
    }

    async fn call(&self, deadline_seconds: Option<u32>, ack_ids: Vec<String>) -> Result<(), Status> {
        let subscription = self.subscription.clone();
        match deadline_seconds {
            None => {
                self.transport
                    .acknowledge(AcknowledgeRequest {
                        subscription,
                        ack_ids,
                    })
                    .await
            }
            Some(seconds) => {
                self.transport
                    .modify_ack_deadline(ModifyAckDeadlineRequest {
                        subscription,
                        ack_ids,
                        ack_deadline_seconds: seconds as i32,
                    })
                    .await
            }
        }
    }
}

fn complete_all(requests: Vec<AckRequest>, outcome: AckResponse) {
    for request in requests {
        request.complete(outcome);
    }
}

/// Resolve what a failed exactly-once operation settled and return what to retry.
///
/// With per-id error metadata, ids missing from it succeeded. Without it the
/// status decides for the whole request.
fn classify_failure(status: &Status, requests: Vec<AckRequest>) -> Vec<AckRequest> {
    let Some(info) = status.error_info() else {
        if status.is_retryable() {
            return requests;
        }
        complete_all(requests, AckResponse::from_status(status));
        return Vec::new();
    };

    let mut retry = Vec::new();
    for request in requests {
        match info.metadata.get(&request.ack_id) {
            None => request.complete(AckResponse::Successful),
            Some(reason) if reason.starts_with(TRANSIENT_FAILURE_PREFIX) => retry.push(request),
            Some(reason) if reason == INVALID_ACK_ID => request.complete(AckResponse::Invalid),
            Some(reason) => {
                debug!(ack_id = %request.ack_id, reason = %reason, "ack failed permanently");
                request.complete(AckResponse::Other);
            }
        }
    }
    retry
}

enum StreamEnd {
    Shutdown,
    /// The server closed the stream without an error.
    Completed,
    Failed(Status),
}

/// One streaming pull and the dispatcher leasing what it receives.
pub(crate) struct StreamingConnection {
    index: usize,
    shared: DispatchShared,
    client_id: String,
    transport: Arc<dyn SubscriberTransport>,
    dispatcher: Arc<Dispatcher>,
    acks: AckSender,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingConnection {
    pub(crate) fn new(
        index: usize,
        shared: DispatchShared,
        transport: Arc<dyn SubscriberTransport>,
        client_id: String,
    ) -> Arc<Self> {
        let acks = AckSender::new(
            shared.subscription.clone(),
            Arc::clone(&transport),
            shared.config.ack_retry_timeout,
            shared.scheduler.clone(),
        );
        let dispatcher = Dispatcher::new(shared.clone(), Arc::new(acks.clone()));
        Arc::new(Self {
            index,
            shared,
            client_id,
            transport,
            dispatcher,
            acks,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Start leasing and pulling. A terminal stream failure is reported on `failures`.
    pub(crate) fn start(self: &Arc<Self>, failures: mpsc::UnboundedSender<Status>) {
        self.dispatcher.start();
        let connection = Arc::clone(self);
        let handle = self.shared.scheduler.spawn(connection.run(failures));
        *self.task.lock() = Some(handle);
    }

    /// Close the stream, settle outstanding messages per the shutdown mode and
    /// wait for the resulting ack operations.
    pub(crate) async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.dispatcher.stop().await;
        self.acks.wait_idle().await;
        debug!(subscription = %self.shared.subscription, stream = self.index, "streaming connection stopped");
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    async fn run(self: Arc<Self>, failures: mpsc::UnboundedSender<Status>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.stream_once(&mut backoff).await {
                StreamEnd::Shutdown => return,
                StreamEnd::Completed => {
                    debug!(subscription = %self.shared.subscription, stream = self.index, "stream completed; reopening");
                    backoff = INITIAL_BACKOFF;
                }
                StreamEnd::Failed(status) if status.is_retryable() => {
                    t_counter!("pubsub_stream_reconnects_total").increment(1);
                    debug!(
                        subscription = %self.shared.subscription,
                        stream = self.index,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %status,
                        "stream failed; reconnecting"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = crate::next_backoff(backoff, BACKOFF_MULTIPLIER, MAX_BACKOFF);
                }
                StreamEnd::Failed(status) => {
                    error!(
                        subscription = %self.shared.subscription,
                        stream = self.index,
                        error = %status,
                        "streaming pull failed permanently"
                    );
                    self.dispatcher.abort(AckResponse::from_status(&status));
                    self.acks.wait_idle().await;
                    let _ = failures.send(status);
                    return;
                }
            }
        }
    }

    async fn stream_once(&self, backoff: &mut Duration) -> StreamEnd {
        let opened = tokio::select! {
            _ = self.shutdown.cancelled() => return StreamEnd::Shutdown,
            opened = self.transport.open_streaming_pull() => opened,
        };
        let mut stream: Box<dyn PullStream> = match opened {
            Ok(stream) => stream,
            Err(status) => return StreamEnd::Failed(status),
        };
        if let Err(status) = stream.send(self.initial_request()).await {
            return StreamEnd::Failed(status);
        }
        stream.request(1);
        debug!(subscription = %self.shared.subscription, stream = self.index, "stream opened");

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    stream.close_with_error(Status::cancelled("subscriber shutting down"));
                    return StreamEnd::Shutdown;
                }
                next = stream.next() => next,
            };
            let response = match next {
                None => return StreamEnd::Completed,
                Some(Err(status)) => return StreamEnd::Failed(status),
                Some(Ok(response)) => response,
            };

            *backoff = INITIAL_BACKOFF;
            let properties = response.subscription_properties.unwrap_or_default();
            self.dispatcher
                .set_exactly_once(properties.exactly_once_delivery_enabled);
            self.dispatcher
                .set_message_ordering(properties.message_ordering_enabled);
            trace!(
                stream = self.index,
                count = response.received_messages.len(),
                "received messages"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    stream.close_with_error(Status::cancelled("subscriber shutting down"));
                    return StreamEnd::Shutdown;
                }
                _ = self.dispatcher.process_received(response.received_messages) => {}
            }
            stream.request(1);
        }
    }

    fn initial_request(&self) -> StreamingPullRequest {
        let flow = &self.shared.flow_controller;
        StreamingPullRequest {
            subscription: self.shared.subscription.clone(),
            stream_ack_deadline_seconds: self.shared.config.stream_ack_deadline.as_secs() as i32,
            client_id: self.client_id.clone(),
            max_outstanding_messages: flow.max_outstanding_elements().map_or(0, |v| v as i64),
            max_outstanding_bytes: flow.max_outstanding_bytes().map_or(0, |v| v as i64),
            ..StreamingPullRequest::default()
        }
    }
}
