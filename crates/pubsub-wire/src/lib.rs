// Value types exchanged with the pub/sub service plus the transport boundary traits.
//
// The runtime in `pubsub-client` never touches an encoder: it builds these plain
// structs and hands them to a `PublisherTransport` / `SubscriberTransport`
// implementation. Sizes that matter for batching are computed here with the
// same length-delimited rules the service uses on the wire, so batch limits line
// up with what the server will actually enforce.
use bytes::Bytes;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

mod size;
mod status;
mod transport;

pub use size::{length_delimited_len, varint_len};
pub use status::{Code, ErrorInfo, Status};
pub use transport::{PublisherTransport, PullStream, SubscriberTransport};

/// Hard server-side cap on messages in a single publish request.
pub const MAX_PUBLISH_ELEMENT_COUNT: usize = 1000;
/// Hard server-side cap on the encoded size of a publish request.
pub const MAX_PUBLISH_REQUEST_BYTES: usize = 10_000_000;
/// Upper bound on ack ids carried by one acknowledge/modify request.
pub const MAX_ACK_IDS_PER_REQUEST: usize = 1000;
/// Lower bound accepted for a stream/modify ack deadline.
pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
/// Upper bound accepted for a stream/modify ack deadline.
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);
/// Attribute set on received messages carrying the delivery attempt counter.
pub const DELIVERY_ATTEMPT_ATTRIBUTE: &str = "googclient_deliveryattempt";

const PUBLISH_MESSAGES_FIELD: u32 = 2;

/// A message as published or delivered.
///
/// ```
/// use pubsub_wire::PubsubMessage;
///
/// let message = PubsubMessage::new("hello").with_ordering_key("k1");
/// assert_eq!(message.ordering_key, "k1");
/// assert!(message.encoded_len() > 5);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubsubMessage {
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    /// Assigned by the service; empty on outbound messages.
    pub message_id: String,
    pub publish_time: Option<SystemTime>,
    /// Empty means unordered.
    pub ordering_key: String,
}

impl PubsubMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    pub fn has_ordering_key(&self) -> bool {
        !self.ordering_key.is_empty()
    }

    /// Encoded size of the message body (without the enclosing field header).
    pub fn encoded_len(&self) -> usize {
        let mut len = size::bytes_field_len(1, self.data.len());
        for (key, value) in &self.attributes {
            let entry = size::bytes_field_len(1, key.len()) + size::bytes_field_len(2, value.len());
            len += length_delimited_len(2, entry);
        }
        len += size::bytes_field_len(3, self.message_id.len());
        if let Some(publish_time) = self.publish_time {
            let since_epoch = publish_time
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO);
            let timestamp = size::varint_field_len(1, since_epoch.as_secs())
                + size::varint_field_len(2, u64::from(since_epoch.subsec_nanos()));
            len += length_delimited_len(4, timestamp);
        }
        len += size::bytes_field_len(5, self.ordering_key.len());
        len
    }

    /// Bytes this message adds to a `PublishRequest` (field header included).
    pub fn size_in_publish_request(&self) -> usize {
        length_delimited_len(PUBLISH_MESSAGES_FIELD, self.encoded_len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub topic: String,
    pub messages: Vec<PubsubMessage>,
}

impl PublishRequest {
    /// Encoded size of the request envelope before any message is added.
    pub fn base_len(topic: &str) -> usize {
        size::bytes_field_len(1, topic.len())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishResponse {
    /// One id per published message, in request order.
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
    /// Zero when the subscription has no dead-letter policy.
    pub delivery_attempt: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionProperties {
    pub exactly_once_delivery_enabled: bool,
    pub message_ordering_enabled: bool,
}

/// Client-to-server message on the streaming pull channel.
///
/// Only the first request on a stream carries the subscription and flow control
/// hints; the runtime sends acks through the unary calls instead of the stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingPullRequest {
    pub subscription: String,
    pub stream_ack_deadline_seconds: i32,
    pub client_id: String,
    /// Zero disables the server-side hint.
    pub max_outstanding_messages: i64,
    /// Zero disables the server-side hint.
    pub max_outstanding_bytes: i64,
    pub ack_ids: Vec<String>,
    pub modify_deadline_seconds: Vec<i32>,
    pub modify_deadline_ack_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedMessage>,
    pub subscription_properties: Option<SubscriptionProperties>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcknowledgeRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyAckDeadlineRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
    /// Zero makes the messages immediately eligible for redelivery.
    pub ack_deadline_seconds: i32,
}
