// Per-ordering-key batch accumulator.
use crate::config::BatchingConfig;
use crate::error::PublishError;
use crate::promise::Completer;
use pubsub_wire::PubsubMessage;
use smallvec::SmallVec;
use std::mem;
use tokio::time::Instant;

pub(crate) type PublishCompleter = Completer<Result<String, PublishError>>;

/// One admitted message waiting for its id.
#[derive(Debug)]
pub(crate) struct OutstandingPublish {
    pub(crate) message: PubsubMessage,
    /// Bytes this message adds to a publish request; also what flow control holds.
    pub(crate) size: usize,
    pub(crate) done: PublishCompleter,
}

impl OutstandingPublish {
    pub(crate) fn new(message: PubsubMessage, done: PublishCompleter) -> Self {
        let size = message.size_in_publish_request();
        Self {
            message,
            size,
            done,
        }
    }
}

/// A popped batch: immutable from here on, ready for one publish call.
#[derive(Debug)]
pub(crate) struct OutstandingBatch {
    pub(crate) ordering_key: String,
    pub(crate) messages: Vec<OutstandingPublish>,
    pub(crate) batch_bytes: usize,
    pub(crate) created_at: Instant,
}

impl OutstandingBatch {
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }
}

/// Zero, one or two batches that became ready during an `add`.
pub(crate) type ReadyBatches = SmallVec<[OutstandingBatch; 2]>;

/// The open batch for one ordering key (or the unordered group).
#[derive(Debug)]
pub(crate) struct MessagesBatch {
    ordering_key: String,
    messages: Vec<OutstandingPublish>,
    /// Starts at the request envelope size, so the threshold bounds the whole request.
    batch_bytes: usize,
    base_bytes: usize,
    created_at: Instant,
    element_count_threshold: usize,
    request_byte_threshold: usize,
}

impl MessagesBatch {
    pub(crate) fn new(
        ordering_key: impl Into<String>,
        config: &BatchingConfig,
        base_bytes: usize,
    ) -> Self {
        Self {
            ordering_key: ordering_key.into(),
            messages: Vec::new(),
            batch_bytes: base_bytes,
            base_bytes,
            created_at: Instant::now(),
            element_count_threshold: config.element_count_threshold,
            request_byte_threshold: config.request_byte_threshold,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    #[cfg(test)]
    pub(crate) fn batch_bytes(&self) -> usize {
        self.batch_bytes
    }

    /// Append `item`, returning any batches that are now ready to send.
    pub(crate) fn add(&mut self, item: OutstandingPublish) -> ReadyBatches {
        let mut ready = ReadyBatches::new();
        // Never let an existing batch grow past the byte threshold.
        if !self.is_empty() && self.batch_bytes + item.size > self.request_byte_threshold {
            ready.push(self.pop_outstanding_batch());
        }

        if self.is_empty() {
            self.created_at = Instant::now();
        }
        self.batch_bytes += item.size;
        self.messages.push(item);

        // An oversized message lands here alone and goes out immediately.
        if self.batch_bytes >= self.request_byte_threshold
            || self.messages.len() >= self.element_count_threshold
        {
            ready.push(self.pop_outstanding_batch());
        }
        ready
    }

    /// Swap in a fresh empty batch and hand back the current one.
    pub(crate) fn pop_outstanding_batch(&mut self) -> OutstandingBatch {
        let batch_bytes = mem::replace(&mut self.batch_bytes, self.base_bytes);
        OutstandingBatch {
            ordering_key: self.ordering_key.clone(),
            messages: mem::take(&mut self.messages),
            batch_bytes,
            created_at: mem::replace(&mut self.created_at, Instant::now()),
        }
    }

    /// Remove every message without sending, e.g. after the key failed.
    pub(crate) fn drain(&mut self) -> Vec<OutstandingPublish> {
        self.batch_bytes = self.base_bytes;
        mem::take(&mut self.messages)
    }
}
