// Error types surfaced by the publish and subscribe engines.
use pubsub_wire::Status;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowControlError {
    #[error("flow control: outstanding element count limit of {limit} reached")]
    MaxOutstandingElementsReached { limit: u64 },
    #[error("flow control: outstanding byte limit of {limit} reached")]
    MaxOutstandingBytesReached { limit: u64 },
    #[error("flow control: request of {size} bytes exceeds the {limit} byte limit")]
    RequestTooLarge { size: u64, limit: u64 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publisher is shut down")]
    Shutdown,
    #[error("cannot publish with an ordering key when message ordering is disabled")]
    OrderingDisabled,
    #[error(transparent)]
    FlowControl(#[from] FlowControlError),
    #[error("ordering key {key:?} is paused after a prior failure; call resume_publish to continue")]
    KeyPaused { key: String },
    #[error("publish cancelled: an earlier batch for ordering key {key:?} failed")]
    Cancelled { key: String },
    #[error("publish rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("publish response carried {received} ids for {expected} messages")]
    IdCountMismatch { expected: usize, received: usize },
    #[error("publish outcome dropped before completion")]
    Dropped,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid config {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("subscriber already started")]
    AlreadyStarted,
    #[error("subscriber is not running")]
    NotRunning,
    #[error("streaming pull terminated: {0}")]
    Stream(Status),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
