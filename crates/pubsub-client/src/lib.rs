// Client-side runtime for a managed publish/subscribe service.
//
// Two engines live here:
// - the publish pipeline: flow-controlled admission, per-ordering-key batching,
//   alarm/threshold flushing and retry-safe submission through a
//   `PublisherTransport`;
// - the subscribe engine: a streaming pull connection feeding a lease tracker
//   that dispatches to user callbacks, extends deadlines from observed ack
//   latency and batches acks/nacks/receipts into unary calls.
//
// CONCURRENCY NOTES
// -----------------
// - Each component owns its locks. The batching mutex, the flow control mutex,
//   the sequential executor's key table and the dispatcher state never nest in
//   the reverse order, and no lock is held across an `.await`.
// - Periodic work (publish flush alarm, the 100ms dispatcher tick) runs on an
//   injected `Scheduler`, so whoever creates a component also controls when its
//   background work stops.
// - User callbacks run on spawned tasks bounded by a semaphore; ordered
//   deliveries are funnelled through the per-key sequential executor instead.
use std::time::Duration;

#[macro_use]
mod macros;

pub mod config;
pub mod error;
pub mod flow_control;
pub mod promise;
pub mod publisher;
pub mod scheduler;
pub mod sequential;
pub mod subscriber;
mod waiter;

pub use config::{
    BatchingConfig, FlowControlBehavior, FlowControlConfig, PublisherConfig, RetryConfig,
    ShutdownConfig, ShutdownMode, SubscriberConfig,
};
pub use error::{ConfigError, FlowControlError, PublishError, SubscriberError};
pub use flow_control::FlowController;
pub use promise::{Completer, Promise};
pub use publisher::{PublishFuture, Publisher, PublisherStats};
pub use scheduler::{ScheduledTask, Scheduler};
pub use sequential::SequentialExecutor;
pub use subscriber::{
    AckHandle, AckResponse, AckResponseFuture, DispatcherStats, MessageReceiver,
    ReceivedPubsubMessage, Subscriber, receiver_fn,
};

pub use pubsub_wire as wire;

/// Publisher-side retry backoff, scaled by the configured multiplier.
pub(crate) fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    current.mul_f64(multiplier).min(max)
}
