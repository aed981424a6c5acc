// Transport boundary consumed by the client runtime.
//
// Implementations own connection management and encoding. The runtime only
// relies on the contracts documented here.
use crate::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, Status,
    StreamingPullRequest, StreamingPullResponse,
};
use async_trait::async_trait;

/// Unary publish call.
#[async_trait]
pub trait PublisherTransport: Send + Sync + 'static {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, Status>;
}

/// Unary acknowledgement calls plus the streaming pull channel.
#[async_trait]
pub trait SubscriberTransport: Send + Sync + 'static {
    /// Open a new bidirectional streaming pull channel.
    ///
    /// The returned stream starts with zero receive credit: no response is
    /// delivered until [`PullStream::request`] grants some.
    async fn open_streaming_pull(&self) -> Result<Box<dyn PullStream>, Status>;

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status>;

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status>;
}

/// One streaming pull channel with manual receive credit.
#[async_trait]
pub trait PullStream: Send {
    async fn send(&mut self, request: StreamingPullRequest) -> Result<(), Status>;

    /// Grant credit for `count` more responses.
    fn request(&mut self, count: usize);

    /// Next response. `None` means the server completed the stream cleanly;
    /// `Some(Err(_))` means the stream terminated with an error. Either way the
    /// stream yields nothing afterwards.
    async fn next(&mut self) -> Option<Result<StreamingPullResponse, Status>>;

    /// Half-close the send side with an error, best effort.
    fn close_with_error(&mut self, status: Status);
}
