// In-process pub/sub service implementing the client transport traits.
//
// Topics fan published messages out to their subscriptions. Each subscription
// keeps a backlog plus the set of leased (delivered, not yet acked) messages.
// Streaming pulls honor manual credit, leases lapse back into the backlog when
// their deadline passes, and faults can be injected per call kind so the
// client's retry and failure paths can be driven from tests.
use ahash::RandomState;
use async_trait::async_trait;
use parking_lot::Mutex;
use pubsub_wire::{
    AcknowledgeRequest, Code, ErrorInfo, ModifyAckDeadlineRequest, PublishRequest,
    PublishResponse, PublisherTransport, PubsubMessage, PullStream, ReceivedMessage, Status,
    StreamingPullRequest, StreamingPullResponse, SubscriberTransport, SubscriptionProperties,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

pub type Result<T> = std::result::Result<T, MemoryError>;

const DEFAULT_MAX_MESSAGES_PER_RESPONSE: usize = 100;
/// How often an idle stream re-checks for lapsed leases.
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(50);
const INVALID_ACK_ID: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("topic already exists: {0}")]
    TopicExists(String),
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("subscription already exists: {0}")]
    SubscriptionExists(String),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionOptions {
    pub exactly_once_delivery: bool,
    pub message_ordering: bool,
    /// Report delivery attempts, as a subscription with a dead-letter policy does.
    pub dead_letter_policy: bool,
    pub max_messages_per_response: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            exactly_once_delivery: false,
            message_ordering: false,
            dead_letter_policy: false,
            max_messages_per_response: DEFAULT_MAX_MESSAGES_PER_RESPONSE,
        }
    }
}

/// What an open stream is told to do next.
#[derive(Debug, Clone)]
enum StreamSignal {
    Open,
    Complete,
    Fail(Status),
}

#[derive(Debug)]
struct Queued {
    message: PubsubMessage,
    /// Deliveries so far.
    attempts: i32,
}

#[derive(Debug)]
struct Leased {
    queued: Queued,
    deadline: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    options: SubscriptionOptions,
    backlog: VecDeque<Queued>,
    leased: HashMap<String, Leased, RandomState>,
    acked: u64,
    arrivals: Arc<Notify>,
    signal: watch::Sender<StreamSignal>,
}

impl SubscriptionState {
    fn new(topic: String, options: SubscriptionOptions) -> Self {
        let (signal, _) = watch::channel(StreamSignal::Open);
        Self {
            topic,
            options,
            backlog: VecDeque::new(),
            leased: HashMap::with_hasher(RandomState::new()),
            acked: 0,
            arrivals: Arc::new(Notify::new()),
            signal,
        }
    }

    fn properties(&self) -> SubscriptionProperties {
        SubscriptionProperties {
            exactly_once_delivery_enabled: self.options.exactly_once_delivery,
            message_ordering_enabled: self.options.message_ordering,
        }
    }

    fn requeue_lapsed(&mut self, now: Instant) {
        let lapsed: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in lapsed {
            if let Some(lease) = self.leased.remove(&ack_id) {
                trace!(ack_id = %ack_id, "lease lapsed; requeueing");
                self.backlog.push_front(lease.queued);
            }
        }
    }

    /// Lease up to the per-response limit from the front of the backlog.
    fn lease_batch(&mut self, name: &str, deadline: Duration, now: Instant) -> Vec<ReceivedMessage> {
        self.requeue_lapsed(now);
        // A key with a message still leased waits for that message to be settled.
        let blocked: HashSet<String> = if self.options.message_ordering {
            self.leased
                .values()
                .map(|lease| lease.queued.message.ordering_key.clone())
                .filter(|key| !key.is_empty())
                .collect()
        } else {
            HashSet::new()
        };

        let mut received = Vec::new();
        let mut deferred = Vec::new();
        while received.len() < self.options.max_messages_per_response {
            let Some(mut queued) = self.backlog.pop_front() else {
                break;
            };
            if blocked.contains(&queued.message.ordering_key) {
                deferred.push(queued);
                continue;
            }
            queued.attempts += 1;
            let ack_id = format!("{name}/{}", uuid::Uuid::new_v4());
            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message: queued.message.clone(),
                delivery_attempt: if self.options.dead_letter_policy {
                    queued.attempts
                } else {
                    0
                },
            });
            self.leased.insert(
                ack_id,
                Leased {
                    queued,
                    deadline: now + deadline,
                },
            );
        }
        for queued in deferred.into_iter().rev() {
            self.backlog.push_front(queued);
        }
        received
    }

    /// Settle `ack_ids` with `settle`; returns the ids that were not leased.
    fn settle(&mut self, ack_ids: &[String], mut settle: impl FnMut(&mut Self, Leased)) -> Vec<String> {
        let mut unknown = Vec::new();
        for ack_id in ack_ids {
            match self.leased.remove(ack_id) {
                Some(lease) => settle(self, lease),
                None => unknown.push(ack_id.clone()),
            }
        }
        unknown
    }
}

#[derive(Debug, Default)]
struct Faults {
    open: VecDeque<Status>,
    publish: VecDeque<Status>,
    acknowledge: VecDeque<Status>,
    modify_ack_deadline: VecDeque<Status>,
}

#[derive(Debug)]
struct ServiceState {
    topics: HashMap<String, Vec<String>, RandomState>,
    subscriptions: HashMap<String, SubscriptionState, RandomState>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<ServiceState>,
    faults: Mutex<Faults>,
    next_message_id: AtomicU64,
    publish_log: Mutex<Vec<PublishRequest>>,
    stream_requests: Mutex<Vec<StreamingPullRequest>>,
    acknowledge_log: Mutex<Vec<AcknowledgeRequest>>,
    modify_log: Mutex<Vec<ModifyAckDeadlineRequest>>,
    opened_streams: AtomicUsize,
}

/// Cheap handle to one in-process service; clones share state.
#[derive(Debug, Clone)]
pub struct MemoryPubsub {
    inner: Arc<Inner>,
}

impl Default for MemoryPubsub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ServiceState {
                    topics: HashMap::with_hasher(RandomState::new()),
                    subscriptions: HashMap::with_hasher(RandomState::new()),
                }),
                faults: Mutex::new(Faults::default()),
                next_message_id: AtomicU64::new(1),
                publish_log: Mutex::new(Vec::new()),
                stream_requests: Mutex::new(Vec::new()),
                acknowledge_log: Mutex::new(Vec::new()),
                modify_log: Mutex::new(Vec::new()),
                opened_streams: AtomicUsize::new(0),
            }),
        }
    }

    pub fn create_topic(&self, topic: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.topics.contains_key(topic) {
            return Err(MemoryError::TopicExists(topic.to_string()));
        }
        state.topics.insert(topic.to_string(), Vec::new());
        debug!(topic, "topic created");
        Ok(())
    }

    pub fn create_subscription(
        &self,
        subscription: &str,
        topic: &str,
        options: SubscriptionOptions,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.subscriptions.contains_key(subscription) {
            return Err(MemoryError::SubscriptionExists(subscription.to_string()));
        }
        let Some(attached) = state.topics.get_mut(topic) else {
            return Err(MemoryError::TopicNotFound(topic.to_string()));
        };
        attached.push(subscription.to_string());
        state.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState::new(topic.to_string(), options),
        );
        debug!(subscription, topic, "subscription created");
        Ok(())
    }

    /// Remove a subscription; open streams on it fail with NOT_FOUND.
    pub fn delete_subscription(&self, subscription: &str) -> Result<()> {
        let mut state = self.inner.state.lock();
        let Some(removed) = state.subscriptions.remove(subscription) else {
            return Err(MemoryError::SubscriptionNotFound(subscription.to_string()));
        };
        if let Some(attached) = state.topics.get_mut(&removed.topic) {
            attached.retain(|name| name != subscription);
        }
        removed.signal.send_replace(StreamSignal::Fail(Status::new(
            Code::NotFound,
            format!("subscription {subscription} was deleted"),
        )));
        Ok(())
    }

    /// Fail the next `open_streaming_pull` call with `status`.
    pub fn fail_next_open(&self, status: Status) {
        self.inner.faults.lock().open.push_back(status);
    }

    pub fn fail_next_publish(&self, status: Status) {
        self.inner.faults.lock().publish.push_back(status);
    }

    pub fn fail_next_acknowledge(&self, status: Status) {
        self.inner.faults.lock().acknowledge.push_back(status);
    }

    pub fn fail_next_modify_ack_deadline(&self, status: Status) {
        self.inner.faults.lock().modify_ack_deadline.push_back(status);
    }

    /// Terminate every stream currently open on `subscription` with `status`.
    pub fn break_streams(&self, subscription: &str, status: Status) -> Result<()> {
        self.signal(subscription, StreamSignal::Fail(status))
    }

    /// Close every stream currently open on `subscription` cleanly.
    pub fn complete_streams(&self, subscription: &str) -> Result<()> {
        self.signal(subscription, StreamSignal::Complete)
    }

    fn signal(&self, subscription: &str, signal: StreamSignal) -> Result<()> {
        let state = self.inner.state.lock();
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| MemoryError::SubscriptionNotFound(subscription.to_string()))?;
        sub.signal.send_replace(signal);
        Ok(())
    }

    pub fn backlog_len(&self, subscription: &str) -> usize {
        self.with_subscription(subscription, |sub| sub.backlog.len())
    }

    pub fn leased_len(&self, subscription: &str) -> usize {
        self.with_subscription(subscription, |sub| sub.leased.len())
    }

    pub fn acked_count(&self, subscription: &str) -> u64 {
        self.with_subscription(subscription, |sub| sub.acked)
    }

    fn with_subscription<T: Default>(&self, subscription: &str, f: impl FnOnce(&SubscriptionState) -> T) -> T {
        self.inner
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map(f)
            .unwrap_or_default()
    }

    /// Every publish call received, in arrival order, including failed ones.
    pub fn publish_requests(&self) -> Vec<PublishRequest> {
        self.inner.publish_log.lock().clone()
    }

    /// Initial requests of every stream opened so far.
    pub fn stream_requests(&self) -> Vec<StreamingPullRequest> {
        self.inner.stream_requests.lock().clone()
    }

    pub fn acknowledge_requests(&self) -> Vec<AcknowledgeRequest> {
        self.inner.acknowledge_log.lock().clone()
    }

    pub fn modify_ack_deadline_requests(&self) -> Vec<ModifyAckDeadlineRequest> {
        self.inner.modify_log.lock().clone()
    }

    pub fn opened_streams(&self) -> usize {
        self.inner.opened_streams.load(Ordering::SeqCst)
    }

    fn invalid_ack_ids(unknown: Vec<String>) -> Status {
        let metadata = unknown
            .into_iter()
            .map(|ack_id| (ack_id, INVALID_ACK_ID.to_string()))
            .collect();
        Status::new(Code::InvalidArgument, "some ack ids were not valid").with_error_info(
            ErrorInfo {
                reason: "EXACTLY_ONCE_ACKID_FAILURE".into(),
                domain: "pubsub.googleapis.com".into(),
                metadata,
            },
        )
    }
}

#[async_trait]
impl PublisherTransport for MemoryPubsub {
    async fn publish(&self, request: PublishRequest) -> std::result::Result<PublishResponse, Status> {
        self.inner.publish_log.lock().push(request.clone());
        if let Some(status) = self.inner.faults.lock().publish.pop_front() {
            return Err(status);
        }

        let mut state = self.inner.state.lock();
        let ServiceState {
            topics,
            subscriptions,
        } = &mut *state;
        let Some(attached) = topics.get(&request.topic) else {
            return Err(Status::new(
                Code::NotFound,
                format!("topic {} not found", request.topic),
            ));
        };

        let mut message_ids = Vec::with_capacity(request.messages.len());
        let publish_time = SystemTime::now();
        for mut message in request.messages {
            let id = self
                .inner
                .next_message_id
                .fetch_add(1, Ordering::Relaxed)
                .to_string();
            message.message_id = id.clone();
            message.publish_time = Some(publish_time);
            for name in attached {
                if let Some(sub) = subscriptions.get_mut(name) {
                    sub.backlog.push_back(Queued {
                        message: message.clone(),
                        attempts: 0,
                    });
                }
            }
            message_ids.push(id);
        }
        for name in attached {
            if let Some(sub) = subscriptions.get(name) {
                sub.arrivals.notify_waiters();
            }
        }
        trace!(topic = %request.topic, count = message_ids.len(), "published");
        Ok(PublishResponse { message_ids })
    }
}

#[async_trait]
impl SubscriberTransport for MemoryPubsub {
    async fn open_streaming_pull(&self) -> std::result::Result<Box<dyn PullStream>, Status> {
        self.inner.opened_streams.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.inner.faults.lock().open.pop_front() {
            return Err(status);
        }
        Ok(Box::new(MemoryStream {
            inner: Arc::clone(&self.inner),
            binding: None,
            signal: None,
            credit: 0,
            failure: None,
            closed: false,
        }))
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> std::result::Result<(), Status> {
        self.inner.acknowledge_log.lock().push(request.clone());
        if let Some(status) = self.inner.faults.lock().acknowledge.pop_front() {
            return Err(status);
        }
        let mut state = self.inner.state.lock();
        let Some(sub) = state.subscriptions.get_mut(&request.subscription) else {
            return Err(Status::new(Code::NotFound, "subscription not found"));
        };
        let unknown = sub.settle(&request.ack_ids, |sub, _| sub.acked += 1);
        if sub.options.exactly_once_delivery && !unknown.is_empty() {
            return Err(Self::invalid_ack_ids(unknown));
        }
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        request: ModifyAckDeadlineRequest,
    ) -> std::result::Result<(), Status> {
        self.inner.modify_log.lock().push(request.clone());
        if let Some(status) = self.inner.faults.lock().modify_ack_deadline.pop_front() {
            return Err(status);
        }
        let mut state = self.inner.state.lock();
        let Some(sub) = state.subscriptions.get_mut(&request.subscription) else {
            return Err(Status::new(Code::NotFound, "subscription not found"));
        };

        let unknown = if request.ack_deadline_seconds <= 0 {
            let unknown = sub.settle(&request.ack_ids, |sub, lease| {
                sub.backlog.push_front(lease.queued)
            });
            sub.arrivals.notify_waiters();
            unknown
        } else {
            let deadline = Instant::now() + Duration::from_secs(request.ack_deadline_seconds as u64);
            let mut unknown = Vec::new();
            for ack_id in &request.ack_ids {
                match sub.leased.get_mut(ack_id) {
                    Some(lease) => lease.deadline = deadline,
                    None => unknown.push(ack_id.clone()),
                }
            }
            unknown
        };
        if sub.options.exactly_once_delivery && !unknown.is_empty() {
            return Err(Self::invalid_ack_ids(unknown));
        }
        Ok(())
    }
}

/// Subscription a stream was bound to by its initial request.
struct Binding {
    subscription: String,
    ack_deadline: Duration,
    arrivals: Arc<Notify>,
}

struct MemoryStream {
    inner: Arc<Inner>,
    binding: Option<Binding>,
    signal: Option<watch::Receiver<StreamSignal>>,
    credit: usize,
    /// Set when the initial request named an unknown subscription.
    failure: Option<Status>,
    closed: bool,
}

impl MemoryStream {
    fn pull(&self) -> std::result::Result<Option<StreamingPullResponse>, Status> {
        let Some(binding) = self.binding.as_ref() else {
            return Ok(None);
        };
        let mut state = self.inner.state.lock();
        let Some(sub) = state.subscriptions.get_mut(&binding.subscription) else {
            return Err(Status::new(Code::NotFound, "subscription not found"));
        };
        let received = sub.lease_batch(&binding.subscription, binding.ack_deadline, Instant::now());
        if received.is_empty() {
            return Ok(None);
        }
        Ok(Some(StreamingPullResponse {
            received_messages: received,
            subscription_properties: Some(sub.properties()),
        }))
    }
}

#[async_trait]
impl PullStream for MemoryStream {
    async fn send(&mut self, request: StreamingPullRequest) -> std::result::Result<(), Status> {
        if self.closed {
            return Err(Status::new(Code::FailedPrecondition, "stream is closed"));
        }
        if self.binding.is_some() {
            return Ok(());
        }
        self.inner.stream_requests.lock().push(request.clone());
        let state = self.inner.state.lock();
        match state.subscriptions.get(&request.subscription) {
            Some(sub) => {
                self.binding = Some(Binding {
                    subscription: request.subscription.clone(),
                    ack_deadline: Duration::from_secs(
                        request.stream_ack_deadline_seconds.max(0) as u64,
                    ),
                    arrivals: Arc::clone(&sub.arrivals),
                });
                self.signal = Some(sub.signal.subscribe());
            }
            None => {
                self.failure = Some(Status::new(
                    Code::NotFound,
                    format!("subscription {} not found", request.subscription),
                ));
            }
        }
        Ok(())
    }

    fn request(&mut self, count: usize) {
        self.credit += count;
    }

    async fn next(&mut self) -> Option<std::result::Result<StreamingPullResponse, Status>> {
        if self.closed {
            return None;
        }
        if let Some(status) = self.failure.take() {
            self.closed = true;
            return Some(Err(status));
        }
        let Some(arrivals) = self.binding.as_ref().map(|b| Arc::clone(&b.arrivals)) else {
            return std::future::pending().await;
        };
        loop {
            let notified = arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.credit > 0 {
                match self.pull() {
                    Ok(Some(response)) => {
                        self.credit -= 1;
                        return Some(Ok(response));
                    }
                    Ok(None) => {}
                    Err(status) => {
                        self.closed = true;
                        return Some(Err(status));
                    }
                }
            }

            let Some(signal) = self.signal.as_mut() else {
                return std::future::pending().await;
            };
            tokio::select! {
                _ = &mut notified => {}
                changed = signal.changed() => {
                    if changed.is_err() {
                        self.closed = true;
                        return Some(Err(Status::new(Code::NotFound, "subscription not found")));
                    }
                    let next = signal.borrow_and_update().clone();
                    match next {
                        StreamSignal::Open => {}
                        StreamSignal::Complete => {
                            self.closed = true;
                            return None;
                        }
                        StreamSignal::Fail(status) => {
                            self.closed = true;
                            return Some(Err(status));
                        }
                    }
                }
                // Picks up leases that lapsed back into the backlog.
                _ = tokio::time::sleep(LEASE_SWEEP_INTERVAL) => {}
            }
        }
    }

    fn close_with_error(&mut self, status: Status) {
        trace!(error = %status, "stream closed by client");
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TOPIC: &str = "projects/p/topics/t";
    const SUB: &str = "projects/p/subscriptions/s";

    fn service(options: SubscriptionOptions) -> MemoryPubsub {
        let service = MemoryPubsub::new();
        service.create_topic(TOPIC).expect("topic");
        service
            .create_subscription(SUB, TOPIC, options)
            .expect("subscription");
        service
    }

    async fn publish(service: &MemoryPubsub, messages: Vec<PubsubMessage>) -> Vec<String> {
        service
            .publish(PublishRequest {
                topic: TOPIC.into(),
                messages,
            })
            .await
            .expect("publish")
            .message_ids
    }

    async fn open(service: &MemoryPubsub) -> Box<dyn PullStream> {
        let mut stream = service.open_streaming_pull().await.expect("open");
        stream
            .send(StreamingPullRequest {
                subscription: SUB.into(),
                stream_ack_deadline_seconds: 10,
                ..StreamingPullRequest::default()
            })
            .await
            .expect("initial request");
        stream
    }

    async fn next_batch(stream: &mut Box<dyn PullStream>) -> Vec<ReceivedMessage> {
        stream.request(1);
        stream
            .next()
            .await
            .expect("open stream")
            .expect("response")
            .received_messages
    }

    fn ids(received: &[ReceivedMessage]) -> Vec<String> {
        received.iter().map(|r| r.ack_id.clone()).collect()
    }

    #[test]
    fn admin_errors() {
        let service = service(SubscriptionOptions::default());
        assert_eq!(
            service.create_topic(TOPIC),
            Err(MemoryError::TopicExists(TOPIC.into()))
        );
        assert_eq!(
            service.create_subscription("other", "missing", SubscriptionOptions::default()),
            Err(MemoryError::TopicNotFound("missing".into()))
        );
        assert_eq!(
            service.create_subscription(SUB, TOPIC, SubscriptionOptions::default()),
            Err(MemoryError::SubscriptionExists(SUB.into()))
        );
    }

    #[tokio::test]
    async fn publish_assigns_ids_and_fans_out() {
        let service = service(SubscriptionOptions::default());
        service
            .create_subscription("second", TOPIC, SubscriptionOptions::default())
            .expect("subscription");
        let ids = publish(&service, vec![PubsubMessage::new("a"), PubsubMessage::new("b")]).await;
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(service.backlog_len(SUB), 2);
        assert_eq!(service.backlog_len("second"), 2);
        assert_eq!(service.publish_requests().len(), 1);
    }

    #[tokio::test]
    async fn publish_to_missing_topic_fails() {
        let service = MemoryPubsub::new();
        let err = service
            .publish(PublishRequest {
                topic: "nope".into(),
                messages: vec![PubsubMessage::new("a")],
            })
            .await
            .expect_err("missing topic");
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn injected_publish_fault_is_returned_once() {
        let service = service(SubscriptionOptions::default());
        service.fail_next_publish(Status::unavailable("down"));
        let request = PublishRequest {
            topic: TOPIC.into(),
            messages: vec![PubsubMessage::new("a")],
        };
        assert!(service.publish(request.clone()).await.is_err());
        assert!(service.publish(request).await.is_ok());
        assert_eq!(service.backlog_len(SUB), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_waits_for_credit() {
        let service = service(SubscriptionOptions::default());
        publish(&service, vec![PubsubMessage::new("a")]).await;
        let mut stream = open(&service).await;

        let without_credit = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(without_credit.is_err());
        assert_eq!(service.leased_len(SUB), 0);

        let received = next_batch(&mut stream).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message.data.as_ref(), b"a");
        assert_eq!(service.leased_len(SUB), 1);
        assert_eq!(service.stream_requests()[0].subscription, SUB);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_wakes_on_publish() {
        let service = service(SubscriptionOptions::default());
        let mut stream = open(&service).await;
        stream.request(1);
        let publisher = service.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            publish(&publisher, vec![PubsubMessage::new("late")]).await;
        });
        let response = stream.next().await.expect("open").expect("response");
        assert_eq!(response.received_messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_settles_and_nack_redelivers() {
        let service = service(SubscriptionOptions::default());
        publish(&service, vec![PubsubMessage::new("a"), PubsubMessage::new("b")]).await;
        let mut stream = open(&service).await;
        let received = next_batch(&mut stream).await;
        let acked = received[0].ack_id.clone();
        let nacked = received[1].ack_id.clone();

        service
            .acknowledge(AcknowledgeRequest {
                subscription: SUB.into(),
                ack_ids: vec![acked],
            })
            .await
            .expect("ack");
        service
            .modify_ack_deadline(ModifyAckDeadlineRequest {
                subscription: SUB.into(),
                ack_ids: vec![nacked.clone()],
                ack_deadline_seconds: 0,
            })
            .await
            .expect("nack");
        assert_eq!(service.acked_count(SUB), 1);

        let again = next_batch(&mut stream).await;
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message.data.as_ref(), b"b");
        assert_ne!(again[0].ack_id, nacked);
    }

    #[tokio::test(start_paused = true)]
    async fn lapsed_lease_is_redelivered_with_attempt_count() {
        let service = service(SubscriptionOptions {
            dead_letter_policy: true,
            ..SubscriptionOptions::default()
        });
        publish(&service, vec![PubsubMessage::new("a")]).await;
        let mut stream = open(&service).await;
        let first = next_batch(&mut stream).await;
        assert_eq!(first[0].delivery_attempt, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let second = next_batch(&mut stream).await;
        assert_eq!(second[0].delivery_attempt, 2);
        assert_eq!(service.leased_len(SUB), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn modack_extends_lease() {
        let service = service(SubscriptionOptions::default());
        publish(&service, vec![PubsubMessage::new("a")]).await;
        let mut stream = open(&service).await;
        let first = next_batch(&mut stream).await;
        service
            .modify_ack_deadline(ModifyAckDeadlineRequest {
                subscription: SUB.into(),
                ack_ids: ids(&first),
                ack_deadline_seconds: 60,
            })
            .await
            .expect("modack");

        stream.request(1);
        let lapsed = tokio::time::timeout(Duration::from_secs(30), stream.next()).await;
        assert!(lapsed.is_err());
        assert_eq!(service.leased_len(SUB), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_reports_invalid_ack_ids() {
        let service = service(SubscriptionOptions {
            exactly_once_delivery: true,
            ..SubscriptionOptions::default()
        });
        publish(&service, vec![PubsubMessage::new("a")]).await;
        let mut stream = open(&service).await;
        let received = next_batch(&mut stream).await;
        let mut ack_ids = ids(&received);
        ack_ids.push("stale".into());

        let err = service
            .acknowledge(AcknowledgeRequest {
                subscription: SUB.into(),
                ack_ids,
            })
            .await
            .expect_err("stale id");
        let info = err.error_info().expect("error info");
        assert_eq!(info.metadata.len(), 1);
        assert_eq!(
            info.metadata.get("stale").map(String::as_str),
            Some(INVALID_ACK_ID)
        );
        assert_eq!(service.acked_count(SUB), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_key_waits_for_settlement() {
        let service = service(SubscriptionOptions {
            message_ordering: true,
            max_messages_per_response: 1,
            ..SubscriptionOptions::default()
        });
        publish(
            &service,
            vec![
                PubsubMessage::new("k1").with_ordering_key("k"),
                PubsubMessage::new("k2").with_ordering_key("k"),
                PubsubMessage::new("free"),
            ],
        )
        .await;
        let mut stream = open(&service).await;
        let first = next_batch(&mut stream).await;
        assert_eq!(first[0].message.data.as_ref(), b"k1");
        let second = next_batch(&mut stream).await;
        assert_eq!(second[0].message.data.as_ref(), b"free");

        service
            .acknowledge(AcknowledgeRequest {
                subscription: SUB.into(),
                ack_ids: ids(&first),
            })
            .await
            .expect("ack");
        let third = next_batch(&mut stream).await;
        assert_eq!(third[0].message.data.as_ref(), b"k2");
    }

    #[tokio::test(start_paused = true)]
    async fn broken_and_completed_streams() {
        let service = service(SubscriptionOptions::default());
        let mut broken = open(&service).await;
        broken.request(1);
        service
            .break_streams(SUB, Status::unavailable("restarting"))
            .expect("break");
        let err = broken.next().await.expect("terminal").expect_err("failed");
        assert_eq!(err.code, Code::Unavailable);
        assert!(broken.next().await.is_none());

        let mut completed = open(&service).await;
        completed.request(1);
        service.complete_streams(SUB).expect("complete");
        assert!(completed.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_subscription_fails_the_stream() {
        let service = MemoryPubsub::new();
        let mut stream = service.open_streaming_pull().await.expect("open");
        stream
            .send(StreamingPullRequest {
                subscription: "missing".into(),
                ..StreamingPullRequest::default()
            })
            .await
            .expect("send");
        stream.request(1);
        let err = stream.next().await.expect("terminal").expect_err("not found");
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn injected_open_fault() {
        let service = service(SubscriptionOptions::default());
        service.fail_next_open(Status::new(Code::PermissionDenied, "denied"));
        assert!(service.open_streaming_pull().await.is_err());
        assert!(service.open_streaming_pull().await.is_ok());
        assert_eq!(service.opened_streams(), 2);
    }
}
