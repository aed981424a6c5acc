// Ack handles given to receivers and the ack/modack units the dispatcher queues.
use crate::promise::{self, Completer, Promise};
use parking_lot::Mutex;
use pubsub_wire::{Code, Status};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Outcome of an ack or nack as confirmed by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckResponse {
    Successful,
    /// The ack id was not valid any more, e.g. the lease had already expired.
    Invalid,
    PermissionDenied,
    FailedPrecondition,
    Other,
}

impl AckResponse {
    /// Whole-request failure mapping for a terminal status.
    pub(crate) fn from_status(status: &Status) -> Self {
        match status.code {
            Code::Ok => AckResponse::Successful,
            Code::PermissionDenied => AckResponse::PermissionDenied,
            Code::FailedPrecondition => AckResponse::FailedPrecondition,
            _ => AckResponse::Other,
        }
    }
}

impl fmt::Display for AckResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckResponse::Successful => "SUCCESSFUL",
            AckResponse::Invalid => "INVALID",
            AckResponse::PermissionDenied => "PERMISSION_DENIED",
            AckResponse::FailedPrecondition => "FAILED_PRECONDITION",
            AckResponse::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Resolves once the ack or nack it came from has a final outcome.
///
/// Without response tracking it is ready immediately with `Successful`.
#[derive(Debug)]
pub struct AckResponseFuture {
    promise: Promise<AckResponse>,
}

impl AckResponseFuture {
    fn ready(response: AckResponse) -> Self {
        Self {
            promise: Promise::ready(response),
        }
    }
}

impl Future for AckResponseFuture {
    type Output = AckResponse;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.promise)
            .poll(cx)
            .map(|response| response.unwrap_or(AckResponse::Other))
    }
}

/// What happened to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Ack,
    Nack,
    /// The receiver returned an error or panicked.
    CallbackFailed,
    /// The handle was dropped without a decision.
    Dropped,
    /// The lease ran out before the message reached a receiver.
    Expired,
}

#[derive(Debug)]
pub(crate) struct Decision {
    pub(crate) reply: Reply,
    pub(crate) response: Option<Completer<AckResponse>>,
}

impl Decision {
    pub(crate) fn bare(reply: Reply) -> Self {
        Self {
            reply,
            response: None,
        }
    }
}

pub(crate) type DecisionSlot = Arc<Mutex<Option<oneshot::Sender<Decision>>>>;

pub(crate) fn decision_slot() -> (DecisionSlot, oneshot::Receiver<Decision>) {
    let (tx, rx) = oneshot::channel();
    (Arc::new(Mutex::new(Some(tx))), rx)
}

/// Send `decision` unless a decision was already made through `slot`.
pub(crate) fn decide(slot: &DecisionSlot, decision: Decision) -> bool {
    match slot.lock().take() {
        Some(tx) => tx.send(decision).is_ok(),
        None => false,
    }
}

/// Acknowledgement capability for one delivered message.
///
/// Consumed by [`AckHandle::ack`] or [`AckHandle::nack`]. Dropping it without
/// either counts as a nack.
pub struct AckHandle {
    ack_id: String,
    slot: DecisionSlot,
    track_responses: bool,
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("ack_id", &self.ack_id)
            .field("track_responses", &self.track_responses)
            .finish()
    }
}

impl AckHandle {
    pub(crate) fn new(ack_id: String, slot: DecisionSlot, track_responses: bool) -> Self {
        Self {
            ack_id,
            slot,
            track_responses,
        }
    }

    pub fn ack_id(&self) -> &str {
        &self.ack_id
    }

    pub fn ack(self) -> AckResponseFuture {
        self.reply(Reply::Ack)
    }

    /// Make the message available for redelivery right away.
    pub fn nack(self) -> AckResponseFuture {
        self.reply(Reply::Nack)
    }

    fn reply(self, reply: Reply) -> AckResponseFuture {
        if !self.track_responses {
            decide(&self.slot, Decision::bare(reply));
            return AckResponseFuture::ready(AckResponse::Successful);
        }
        let (done, promise) = promise::channel();
        let decision = Decision {
            reply,
            response: Some(done),
        };
        if decide(&self.slot, decision) {
            AckResponseFuture { promise }
        } else {
            // The receiver already failed and the message was nacked for it.
            AckResponseFuture::ready(AckResponse::Other)
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        decide(&self.slot, Decision::bare(Reply::Dropped));
    }
}

/// One ack id queued for an ack, nack or modack, with its optional outcome sink.
#[derive(Debug)]
pub(crate) struct AckRequest {
    pub(crate) ack_id: String,
    pub(crate) response: Option<Completer<AckResponse>>,
}

impl AckRequest {
    pub(crate) fn new(ack_id: impl Into<String>) -> Self {
        Self {
            ack_id: ack_id.into(),
            response: None,
        }
    }

    pub(crate) fn with_response(
        ack_id: impl Into<String>,
        response: Option<Completer<AckResponse>>,
    ) -> Self {
        Self {
            ack_id: ack_id.into(),
            response,
        }
    }

    pub(crate) fn complete(self, outcome: AckResponse) {
        if let Some(response) = self.response {
            response.complete(outcome);
        }
    }
}

/// Ack ids sharing one deadline, bounded to a single request.
#[derive(Debug)]
pub(crate) struct ModackRequest {
    pub(crate) deadline_seconds: u32,
    pub(crate) requests: Vec<AckRequest>,
    /// First modack after receipt rather than a lease extension.
    pub(crate) receipt: bool,
}

/// A drained batch on its way to the wire, with the delivery mode it was
/// queued under.
#[derive(Debug)]
pub(crate) enum AckOperation {
    Ack(Vec<AckRequest>),
    Modack(ModackRequest),
}

impl AckOperation {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            AckOperation::Ack(_) => "ack",
            AckOperation::Modack(modack) if modack.deadline_seconds == 0 => "nack",
            AckOperation::Modack(modack) if modack.receipt => "receipt",
            AckOperation::Modack(_) => "modack",
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        match self {
            AckOperation::Ack(requests) => requests.len(),
            AckOperation::Modack(modack) => modack.requests.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn untracked_ack_is_successful_immediately() {
        let (slot, rx) = decision_slot();
        let handle = AckHandle::new("a".into(), slot, false);
        assert_eq!(handle.ack().await, AckResponse::Successful);
        let decision = rx.await.expect("decision");
        assert_eq!(decision.reply, Reply::Ack);
        assert!(decision.response.is_none());
    }

    #[tokio::test]
    async fn tracked_nack_waits_for_confirmation() {
        let (slot, rx) = decision_slot();
        let handle = AckHandle::new("a".into(), slot, true);
        let future = handle.nack();
        let decision = rx.await.expect("decision");
        assert_eq!(decision.reply, Reply::Nack);
        AckRequest::with_response("a", decision.response).complete(AckResponse::Invalid);
        assert_eq!(future.await, AckResponse::Invalid);
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_nack() {
        let (slot, rx) = decision_slot();
        drop(AckHandle::new("a".into(), slot, true));
        assert_eq!(rx.await.expect("decision").reply, Reply::Dropped);
    }

    #[tokio::test]
    async fn late_ack_after_failure_reports_other() {
        let (slot, rx) = decision_slot();
        let handle = AckHandle::new("a".into(), Arc::clone(&slot), true);
        assert!(decide(&slot, Decision::bare(Reply::CallbackFailed)));
        assert_eq!(handle.ack().await, AckResponse::Other);
        assert_eq!(rx.await.expect("decision").reply, Reply::CallbackFailed);
    }

    #[tokio::test]
    async fn abandoned_response_resolves_other() {
        let (slot, rx) = decision_slot();
        let future = AckHandle::new("a".into(), slot, true).ack();
        drop(rx.await.expect("decision"));
        assert_eq!(future.await, AckResponse::Other);
    }

    #[test]
    fn status_mapping() {
        let denied = Status::new(Code::PermissionDenied, "no");
        let precondition = Status::new(Code::FailedPrecondition, "no");
        let other = Status::new(Code::NotFound, "gone");
        assert_eq!(AckResponse::from_status(&denied), AckResponse::PermissionDenied);
        assert_eq!(
            AckResponse::from_status(&precondition),
            AckResponse::FailedPrecondition
        );
        assert_eq!(AckResponse::from_status(&other), AckResponse::Other);
    }

    #[test]
    fn operation_kinds() {
        let nack = AckOperation::Modack(ModackRequest {
            deadline_seconds: 0,
            requests: vec![AckRequest::new("a")],
            receipt: false,
        });
        assert_eq!(nack.kind(), "nack");
        assert_eq!(nack.len(), 1);
        assert_eq!(AckOperation::Ack(Vec::new()).kind(), "ack");
    }
}
