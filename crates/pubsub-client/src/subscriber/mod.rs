// Subscribe engine: streaming connections, lease tracking and user delivery.
//
// A `Subscriber` runs `parallel_pull_count` streaming connections. They share
// one flow controller, one ack-latency distribution and one callback
// semaphore, so limits hold across the whole subscriber rather than per stream.
// The first connection to fail for good stops the others.
mod ack;
mod connection;
mod dispatcher;
mod distribution;

pub use ack::{AckHandle, AckResponse, AckResponseFuture};
pub use dispatcher::DispatcherStats;

use crate::config::SubscriberConfig;
use crate::error::{ConfigError, SubscriberError};
use crate::flow_control::FlowController;
use crate::scheduler::Scheduler;
use async_trait::async_trait;
use bytes::Bytes;
use connection::StreamingConnection;
use dispatcher::DispatchShared;
use distribution::Distribution;
use parking_lot::Mutex;
use pubsub_wire::{
    DELIVERY_ATTEMPT_ATTRIBUTE, MAX_ACK_DEADLINE, PubsubMessage, Status, SubscriberTransport,
};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// User callback for delivered messages.
///
/// Returning an error, or panicking, nacks the message unless the handle was
/// already used.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    async fn receive(&self, message: ReceivedPubsubMessage, ack: AckHandle) -> anyhow::Result<()>;
}

struct FnReceiver<F>(F);

#[async_trait]
impl<F, Fut> MessageReceiver for FnReceiver<F>
where
    F: Fn(ReceivedPubsubMessage, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn receive(&self, message: ReceivedPubsubMessage, ack: AckHandle) -> anyhow::Result<()> {
        (self.0)(message, ack).await
    }
}

/// Wrap an async closure as a [`MessageReceiver`].
pub fn receiver_fn<F, Fut>(f: F) -> Arc<dyn MessageReceiver>
where
    F: Fn(ReceivedPubsubMessage, AckHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnReceiver(f))
}

/// A message as handed to a [`MessageReceiver`].
#[derive(Debug, Clone)]
pub struct ReceivedPubsubMessage {
    ack_id: String,
    message: PubsubMessage,
    delivery_attempt: i32,
}

impl ReceivedPubsubMessage {
    pub(crate) fn new(ack_id: String, mut message: PubsubMessage, delivery_attempt: i32) -> Self {
        if delivery_attempt > 0 {
            message.attributes.insert(
                DELIVERY_ATTEMPT_ATTRIBUTE.to_string(),
                delivery_attempt.to_string(),
            );
        }
        Self {
            ack_id,
            message,
            delivery_attempt,
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub fn message(&self) -> &PubsubMessage {
        &self.message
    }

    pub fn data(&self) -> &Bytes {
        &self.message.data
    }

    pub fn ordering_key(&self) -> &str {
        &self.message.ordering_key
    }

    /// How many times the service has delivered this message; zero when the
    /// subscription has no dead-letter policy.
    pub fn delivery_attempt(&self) -> i32 {
        self.delivery_attempt
    }

    pub fn into_message(self) -> PubsubMessage {
        self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Running,
    Stopping,
    Terminated,
}

struct SubscriberState {
    lifecycle: Lifecycle,
    connections: Vec<Arc<StreamingConnection>>,
    failure: Option<Status>,
    monitor: Option<JoinHandle<()>>,
}

/// Pulls from one subscription over several streams and dispatches to a receiver.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.inner.subscription)
            .field("lifecycle", &self.inner.state.lock().lifecycle)
            .finish()
    }
}

struct SubscriberInner {
    subscription: String,
    config: Arc<SubscriberConfig>,
    transport: Arc<dyn SubscriberTransport>,
    receiver: Arc<dyn MessageReceiver>,
    scheduler: Scheduler,
    state: Mutex<SubscriberState>,
    terminated: watch::Sender<bool>,
}

impl Subscriber {
    pub fn new(
        subscription: impl Into<String>,
        config: SubscriberConfig,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Arc<dyn MessageReceiver>,
        scheduler: Scheduler,
    ) -> Result<Self, ConfigError> {
        let subscription = subscription.into();
        if subscription.is_empty() {
            return Err(ConfigError::invalid("subscription", "must not be empty"));
        }
        config.validate()?;
        let (terminated, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(SubscriberInner {
                subscription,
                config: Arc::new(config),
                transport,
                receiver,
                scheduler,
                state: Mutex::new(SubscriberState {
                    lifecycle: Lifecycle::New,
                    connections: Vec::new(),
                    failure: None,
                    monitor: None,
                }),
                terminated,
            }),
        })
    }

    pub fn subscription(&self) -> &str {
        &self.inner.subscription
    }

    /// Open the streaming connections. A subscriber starts at most once.
    pub fn start(&self) -> Result<(), SubscriberError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.lifecycle != Lifecycle::New {
            return Err(SubscriberError::AlreadyStarted);
        }

        let config = &inner.config;
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let shared = DispatchShared {
            subscription: inner.subscription.clone(),
            config: Arc::clone(config),
            receiver: Arc::clone(&inner.receiver),
            flow_controller: Arc::new(FlowController::new(&config.flow_control)),
            distribution: Arc::new(Distribution::new(MAX_ACK_DEADLINE.as_secs() as usize)),
            callbacks: Arc::new(Semaphore::new(config.callback_concurrency())),
            scheduler: inner.scheduler.clone(),
        };

        let (failures, failed) = mpsc::unbounded_channel();
        for index in 0..config.parallel_pull_count {
            let connection = StreamingConnection::new(
                index,
                shared.clone(),
                Arc::clone(&inner.transport),
                client_id.clone(),
            );
            connection.start(failures.clone());
            state.connections.push(connection);
        }
        state.monitor = Some(
            inner
                .scheduler
                .spawn(monitor_failures(Arc::downgrade(inner), failed)),
        );
        state.lifecycle = Lifecycle::Running;
        info!(
            subscription = %inner.subscription,
            streams = config.parallel_pull_count,
            client_id = %client_id,
            "subscriber started"
        );
        Ok(())
    }

    /// Stop every stream and settle outstanding messages per the shutdown mode.
    pub async fn stop(&self) -> Result<(), SubscriberError> {
        if self.inner.shutdown().await {
            Ok(())
        } else {
            Err(SubscriberError::NotRunning)
        }
    }

    /// Resolves once the subscriber has fully stopped, with the stream error
    /// that stopped it if there was one.
    pub async fn await_terminated(&self) -> Result<(), SubscriberError> {
        let mut terminated = self.inner.terminated.subscribe();
        // The sender lives in `inner`, so the channel cannot close while we wait.
        let _ = terminated.wait_for(|done| *done).await;
        match self.failure() {
            Some(status) => Err(SubscriberError::Stream(status)),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Running
    }

    /// The first terminal stream error, if any.
    pub fn failure(&self) -> Option<Status> {
        self.inner.state.lock().failure.clone()
    }

    /// Counters summed across all streams.
    pub fn stats(&self) -> DispatcherStats {
        let connections = self.inner.state.lock().connections.clone();
        connections
            .iter()
            .map(|connection| connection.stats())
            .fold(DispatcherStats::default(), |total, stats| total + stats)
    }
}

impl SubscriberInner {
    /// Returns false when another caller already stopped, or nothing was started.
    async fn shutdown(&self) -> bool {
        let connections = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Running {
                return false;
            }
            state.lifecycle = Lifecycle::Stopping;
            state.connections.clone()
        };
        debug!(subscription = %self.subscription, streams = connections.len(), "stopping subscriber");
        futures::future::join_all(connections.iter().map(|connection| connection.stop())).await;

        let monitor = {
            let mut state = self.state.lock();
            state.lifecycle = Lifecycle::Terminated;
            state.monitor.take()
        };
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.terminated.send_replace(true);
        info!(subscription = %self.subscription, "subscriber stopped");
        true
    }
}

async fn monitor_failures(inner: Weak<SubscriberInner>, mut failed: mpsc::UnboundedReceiver<Status>) {
    let Some(status) = failed.recv().await else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };
    inner.state.lock().failure.get_or_insert(status);
    // Detach so aborting the monitor from `shutdown` cannot cut the stop short.
    let scheduler = inner.scheduler.clone();
    scheduler.spawn(async move {
        inner.shutdown().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownConfig;
    use pubsub_wire::{
        AcknowledgeRequest, Code, ModifyAckDeadlineRequest, PullStream, StreamingPullRequest,
        StreamingPullResponse,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Streams that never deliver; opening fails with `fail_with` when set.
    #[derive(Default)]
    struct QuietTransport {
        fail_with: Option<Status>,
        opened: AtomicUsize,
    }

    struct QuietStream;

    #[async_trait]
    impl PullStream for QuietStream {
        async fn send(&mut self, _request: StreamingPullRequest) -> Result<(), Status> {
            Ok(())
        }

        fn request(&mut self, _count: usize) {}

        async fn next(&mut self) -> Option<Result<StreamingPullResponse, Status>> {
            std::future::pending().await
        }

        fn close_with_error(&mut self, _status: Status) {}
    }

    #[async_trait]
    impl SubscriberTransport for QuietTransport {
        async fn open_streaming_pull(&self) -> Result<Box<dyn PullStream>, Status> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(status) => Err(status.clone()),
                None => Ok(Box::new(QuietStream)),
            }
        }

        async fn acknowledge(&self, _request: AcknowledgeRequest) -> Result<(), Status> {
            Ok(())
        }

        async fn modify_ack_deadline(&self, _request: ModifyAckDeadlineRequest) -> Result<(), Status> {
            Ok(())
        }
    }

    fn subscriber(transport: Arc<QuietTransport>, config: SubscriberConfig) -> Subscriber {
        Subscriber::new(
            "projects/p/subscriptions/s",
            config,
            transport,
            receiver_fn(|_message, ack| async move {
                let _ = ack.ack();
                Ok::<(), anyhow::Error>(())
            }),
            Scheduler::current().expect("runtime"),
        )
        .expect("valid subscriber")
    }

    #[test]
    fn delivery_attempt_is_surfaced_as_attribute() {
        let received = ReceivedPubsubMessage::new("a".into(), PubsubMessage::new("x"), 3);
        assert_eq!(received.delivery_attempt(), 3);
        assert_eq!(
            received
                .message()
                .attributes
                .get(DELIVERY_ATTEMPT_ATTRIBUTE)
                .map(String::as_str),
            Some("3")
        );

        let first = ReceivedPubsubMessage::new("b".into(), PubsubMessage::new("x"), 0);
        assert!(first.message().attributes.is_empty());
        assert_eq!(first.data().as_ref(), b"x");
    }

    #[tokio::test]
    async fn rejects_invalid_configuration() {
        let config = SubscriberConfig {
            parallel_pull_count: 0,
            ..SubscriberConfig::default()
        };
        let err = Subscriber::new(
            "projects/p/subscriptions/s",
            config,
            Arc::new(QuietTransport::default()),
            receiver_fn(|_message, _ack| async { Ok::<(), anyhow::Error>(()) }),
            Scheduler::current().expect("runtime"),
        )
        .expect_err("invalid");
        assert!(matches!(err, ConfigError::Invalid { field: "parallel_pull_count", .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_is_start_once_stop_once() {
        let transport = Arc::new(QuietTransport::default());
        let config = SubscriberConfig {
            parallel_pull_count: 3,
            ..SubscriberConfig::default()
        };
        let subscriber = subscriber(Arc::clone(&transport), config);
        assert_eq!(subscriber.stop().await, Err(SubscriberError::NotRunning));

        subscriber.start().expect("start");
        assert_eq!(subscriber.start(), Err(SubscriberError::AlreadyStarted));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.opened.load(Ordering::SeqCst), 3);
        assert!(subscriber.is_running());

        subscriber.stop().await.expect("stop");
        assert!(!subscriber.is_running());
        assert_eq!(subscriber.stop().await, Err(SubscriberError::NotRunning));
        assert_eq!(subscriber.start(), Err(SubscriberError::AlreadyStarted));
        subscriber.await_terminated().await.expect("clean stop");
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_stream_failure_terminates_subscriber() {
        let transport = Arc::new(QuietTransport {
            fail_with: Some(Status::new(Code::NotFound, "subscription does not exist")),
            ..QuietTransport::default()
        });
        let config = SubscriberConfig {
            parallel_pull_count: 2,
            shutdown: ShutdownConfig::default(),
            ..SubscriberConfig::default()
        };
        let subscriber = subscriber(transport, config);
        subscriber.start().expect("start");

        let err = subscriber.await_terminated().await.expect_err("failed");
        match err {
            SubscriberError::Stream(status) => assert_eq!(status.code, Code::NotFound),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!subscriber.is_running());
        assert_eq!(subscriber.stats(), DispatcherStats::default());
    }
}
