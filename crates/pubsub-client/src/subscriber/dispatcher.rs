//! Lease tracker for received messages.
//!
//! # Purpose
//! Every message that arrives on a streaming pull is leased here until the
//! receiver acks or nacks it, the lease runs out, or the subscriber shuts down.
//! A 100ms tick keeps leases alive and turns the queued acks, nacks and
//! receipts into wire-sized ack operations.
//!
//! # Design notes
//! - Leases live in a concurrent map keyed by ack id. The first insert wins; a
//!   duplicate delivery of a leased id is dropped without ack or nack.
//! - `forget` is the only way out of the map and releases the flow control
//!   reservation exactly once, however many paths race to it.
//! - Extensions follow the 99.9th percentile of observed ack latency, clamped to
//!   the configured per-extension bounds and then to the protocol bounds.
//! - Under exactly-once delivery a message reaches its receiver only after its
//!   receipt modack succeeded. Receipts complete out of order, so deliveries
//!   are released in arrival order from the front of a queue.
use super::ack::{
    AckHandle, AckOperation, AckRequest, AckResponse, Decision, DecisionSlot, ModackRequest,
    Reply, decide, decision_slot,
};
use super::distribution::Distribution;
use super::{MessageReceiver, ReceivedPubsubMessage};
use crate::config::{ShutdownMode, SubscriberConfig};
use crate::flow_control::FlowController;
use crate::promise;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::sequential::{FailurePolicy, SequentialExecutor};
use crate::waiter::Waiter;
use ahash::{AHashSet, RandomState};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use parking_lot::Mutex;
use pubsub_wire::{
    MAX_ACK_DEADLINE, MAX_ACK_IDS_PER_REQUEST, MIN_ACK_DEADLINE, PubsubMessage, ReceivedMessage,
};
use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(100);
const DEADLINE_PERCENTILE: f64 = 99.9;
const SLOW_ACK_PERCENTILE: f64 = 99.0;
/// Kept back from a bounded wait-for-processing shutdown to send the final nacks.
const FINAL_NACK_GRACE: Duration = Duration::from_secs(1);

/// Sends drained ack operations to the service without blocking the caller.
pub(crate) trait AckProcessor: Send + Sync + 'static {
    fn send(&self, operation: AckOperation, exactly_once: bool);
}

/// Pieces shared by every stream of one subscriber.
#[derive(Clone)]
pub(crate) struct DispatchShared {
    pub(crate) subscription: String,
    pub(crate) config: Arc<SubscriberConfig>,
    pub(crate) receiver: Arc<dyn MessageReceiver>,
    pub(crate) flow_controller: Arc<FlowController>,
    pub(crate) distribution: Arc<Distribution>,
    pub(crate) callbacks: Arc<Semaphore>,
    pub(crate) scheduler: Scheduler,
}

#[derive(Debug)]
struct Lease {
    total_expiration: Instant,
    reserved_bytes: u64,
}

/// A received message on its way to the receiver.
struct Delivery {
    ack_id: String,
    message: PubsubMessage,
    delivery_attempt: i32,
    received_at: Instant,
    total_expiration: Instant,
    reserved_bytes: u64,
}

struct GatedDelivery {
    delivery: Delivery,
    receipt: Option<AckResponse>,
}

struct DispatcherState {
    deadline_seconds: u32,
    exactly_once: bool,
    ordering: bool,
    /// `None` means the next tick recomputes and extends.
    next_extension_at: Option<Instant>,
    nack_immediately: bool,
    /// Set once the stream failed for good; late decisions resolve with it.
    terminal_response: Option<AckResponse>,
    awaiting_receipt: VecDeque<GatedDelivery>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub outstanding_leases: usize,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub expired: u64,
}

impl std::ops::Add for DispatcherStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            outstanding_leases: self.outstanding_leases + other.outstanding_leases,
            delivered: self.delivered + other.delivered,
            acked: self.acked + other.acked,
            nacked: self.nacked + other.nacked,
            expired: self.expired + other.expired,
        }
    }
}

#[derive(Default)]
struct DispatchCounters {
    delivered: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    expired: AtomicU64,
}

pub(crate) struct Dispatcher {
    shared: DispatchShared,
    acks: Arc<dyn AckProcessor>,
    sequential: SequentialExecutor,
    leases: DashMap<String, Lease, RandomState>,
    pending_acks: Mutex<Vec<AckRequest>>,
    pending_nacks: Mutex<Vec<AckRequest>>,
    pending_receipts: Mutex<Vec<AckRequest>>,
    state: Mutex<DispatcherState>,
    in_flight: Waiter,
    tick: Mutex<Option<ScheduledTask>>,
    counters: DispatchCounters,
}

impl Dispatcher {
    pub(crate) fn new(shared: DispatchShared, acks: Arc<dyn AckProcessor>) -> Arc<Self> {
        // Until latency data exists, extend by the configured minimum or the
        // protocol floor so early leases stay short.
        let min = shared.config.min_duration_per_ack_extension;
        let deadline = if min.is_zero() { MIN_ACK_DEADLINE } else { min };
        let sequential = SequentialExecutor::new(shared.scheduler.clone(), FailurePolicy::Continue);
        Arc::new(Self {
            shared,
            acks,
            sequential,
            leases: DashMap::with_hasher(RandomState::new()),
            pending_acks: Mutex::new(Vec::new()),
            pending_nacks: Mutex::new(Vec::new()),
            pending_receipts: Mutex::new(Vec::new()),
            state: Mutex::new(DispatcherState {
                deadline_seconds: deadline.as_secs() as u32,
                exactly_once: false,
                ordering: false,
                next_extension_at: None,
                nack_immediately: false,
                terminal_response: None,
                awaiting_receipt: VecDeque::new(),
            }),
            in_flight: Waiter::new(),
            tick: Mutex::new(None),
            counters: DispatchCounters::default(),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let task = self
            .shared
            .scheduler
            .schedule_repeating("lease_tick", TICK_INTERVAL, move || {
                let weak = weak.clone();
                async move {
                    if let Some(dispatcher) = weak.upgrade() {
                        dispatcher.tick();
                    }
                    Ok::<(), anyhow::Error>(())
                }
            });
        *self.tick.lock() = Some(task);
    }

    pub(crate) fn set_exactly_once(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.exactly_once != enabled {
            debug!(subscription = %self.shared.subscription, enabled, "exactly-once delivery changed");
            state.exactly_once = enabled;
            // Pick up the new minimum extension on the next tick.
            state.next_extension_at = None;
        }
    }

    pub(crate) fn set_message_ordering(&self, enabled: bool) {
        self.state.lock().ordering = enabled;
    }

    pub(crate) fn deadline_seconds(&self) -> u32 {
        self.state.lock().deadline_seconds
    }

    pub(crate) fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            outstanding_leases: self.leases.len(),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            nacked: self.counters.nacked.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    /// Lease and dispatch one response's worth of messages.
    ///
    /// Waits on flow control per message, which is what holds back the next
    /// stream read.
    pub(crate) async fn process_received(self: &Arc<Self>, messages: Vec<ReceivedMessage>) {
        let received_at = Instant::now();
        let total_expiration = received_at + self.shared.config.max_ack_extension_period;
        for received in messages {
            let ReceivedMessage {
                ack_id,
                message,
                delivery_attempt,
            } = received;
            if self.is_outstanding(&ack_id) {
                trace!(ack_id = %ack_id, "ignoring duplicate delivery");
                continue;
            }
            let exactly_once = self.state.lock().exactly_once;

            let size = message.encoded_len() as u64;
            // A single message larger than the byte limit must not wait forever.
            let reserved_bytes = self
                .shared
                .flow_controller
                .max_outstanding_bytes()
                .map_or(size, |limit| size.min(limit));
            if let Err(err) = self.shared.flow_controller.acquire(reserved_bytes).await {
                warn!(
                    subscription = %self.shared.subscription,
                    ack_id = %ack_id,
                    error = %err,
                    "flow control refused received message; nacking"
                );
                self.pending_nacks.lock().push(AckRequest::new(ack_id));
                continue;
            }

            let delivery = Delivery {
                ack_id,
                message,
                delivery_attempt,
                received_at,
                total_expiration,
                reserved_bytes,
            };
            if exactly_once {
                self.gate_on_receipt(delivery);
            } else {
                self.admit(delivery, true);
            }
        }
    }

    /// Leased, or still waiting on its exactly-once receipt.
    fn is_outstanding(&self, ack_id: &str) -> bool {
        self.leases.contains_key(ack_id)
            || self
                .state
                .lock()
                .awaiting_receipt
                .iter()
                .any(|gated| gated.delivery.ack_id == ack_id)
    }

    fn admit(self: &Arc<Self>, delivery: Delivery, send_receipt: bool) {
        let inserted = match self.leases.entry(delivery.ack_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Lease {
                    total_expiration: delivery.total_expiration,
                    reserved_bytes: delivery.reserved_bytes,
                });
                true
            }
        };
        if !inserted {
            trace!(ack_id = %delivery.ack_id, "ignoring duplicate delivery");
            self.shared.flow_controller.release(delivery.reserved_bytes);
            return;
        }
        self.in_flight.increment(1);
        if send_receipt {
            self.pending_receipts
                .lock()
                .push(AckRequest::new(delivery.ack_id.clone()));
        }
        self.dispatch(delivery);
    }

    fn gate_on_receipt(self: &Arc<Self>, delivery: Delivery) {
        let ack_id = delivery.ack_id.clone();
        let (done, receipt) = promise::channel();
        self.state.lock().awaiting_receipt.push_back(GatedDelivery {
            delivery,
            receipt: None,
        });
        self.pending_receipts
            .lock()
            .push(AckRequest::with_response(ack_id.clone(), Some(done)));

        let weak = Arc::downgrade(self);
        self.shared.scheduler.spawn(async move {
            let outcome = receipt.await.unwrap_or(AckResponse::Other);
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.on_receipt(&ack_id, outcome);
            }
        });
    }

    fn on_receipt(self: &Arc<Self>, ack_id: &str, outcome: AckResponse) {
        let mut ready = Vec::new();
        let mut refused = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(gated) = state
                .awaiting_receipt
                .iter_mut()
                .find(|gated| gated.receipt.is_none() && gated.delivery.ack_id == ack_id)
            {
                gated.receipt = Some(outcome);
            }
            while let Some(front) = state.awaiting_receipt.front() {
                let Some(receipt) = front.receipt else {
                    break;
                };
                if let Some(gated) = state.awaiting_receipt.pop_front() {
                    if receipt == AckResponse::Successful {
                        ready.push(gated.delivery);
                    } else {
                        refused.push((gated.delivery, receipt));
                    }
                }
            }
        }
        for (delivery, receipt) in refused {
            debug!(ack_id = %delivery.ack_id, response = %receipt, "receipt refused; dropping message");
            self.shared.flow_controller.release(delivery.reserved_bytes);
        }
        for delivery in ready {
            self.admit(delivery, false);
        }
    }

    fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        let (slot, decided) = decision_slot();
        let handle = AckHandle::new(
            delivery.ack_id.clone(),
            Arc::clone(&slot),
            self.shared.config.track_ack_responses,
        );

        let ack_id = delivery.ack_id.clone();
        let received_at = delivery.received_at;
        let dispatcher = Arc::clone(self);
        self.shared.scheduler.spawn(async move {
            let decision = decided
                .await
                .unwrap_or_else(|_| Decision::bare(Reply::Dropped));
            dispatcher.on_decision(&ack_id, received_at, decision);
        });

        let ordering_key = delivery.message.ordering_key.clone();
        let ordered = !ordering_key.is_empty() && self.state.lock().ordering;
        let dispatcher = Arc::clone(self);
        if ordered {
            // The executor keeps going after a failed callback; nothing to observe here.
            let _ = self.sequential.submit(&ordering_key, move || async move {
                dispatcher.run_callback(delivery, slot, handle).await;
                Ok::<(), ()>(())
            });
        } else {
            self.shared.scheduler.spawn(async move {
                dispatcher.run_callback(delivery, slot, handle).await;
            });
        }
    }

    async fn run_callback(self: Arc<Self>, delivery: Delivery, slot: DecisionSlot, handle: AckHandle) {
        let Ok(_permit) = Arc::clone(&self.shared.callbacks).acquire_owned().await else {
            decide(&slot, Decision::bare(Reply::CallbackFailed));
            return;
        };
        let deadline = Duration::from_secs(self.state.lock().deadline_seconds.into());
        if delivery.total_expiration + deadline < Instant::now() {
            // Probably redelivered elsewhere by now; nacking would hit that copy.
            trace!(ack_id = %delivery.ack_id, "message expired before delivery");
            decide(&slot, Decision::bare(Reply::Expired));
            return;
        }

        let ack_id = delivery.ack_id.clone();
        let message =
            ReceivedPubsubMessage::new(delivery.ack_id, delivery.message, delivery.delivery_attempt);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        trace!(subscription = %self.shared.subscription, ack_id = %ack_id, "delivering message");

        let outcome = AssertUnwindSafe(self.shared.receiver.receive(message, handle))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(format!("{err:#}")),
            Err(_) => Some("receiver panicked".to_string()),
        };
        if let Some(error) = failure {
            warn!(
                subscription = %self.shared.subscription,
                ack_id = %ack_id,
                error = %error,
                "message receiver failed; nacking"
            );
            decide(&slot, Decision::bare(Reply::CallbackFailed));
        }
    }

    fn on_decision(&self, ack_id: &str, received_at: Instant, decision: Decision) {
        let Decision { reply, response } = decision;
        let request = AckRequest::with_response(ack_id, response);
        let (exactly_once, nack_immediately, terminal) = {
            let state = self.state.lock();
            (
                state.exactly_once,
                state.nack_immediately,
                state.terminal_response,
            )
        };
        if let Some(outcome) = terminal {
            request.complete(outcome);
            self.forget(ack_id);
            return;
        }

        let outcome = match reply {
            Reply::Ack => {
                let latency = received_at.elapsed().as_secs_f64().ceil() as u64;
                if self.shared.distribution.count() > 0
                    && latency >= self.shared.distribution.percentile(SLOW_ACK_PERCENTILE)
                {
                    debug!(ack_id = %ack_id, latency_secs = latency, "ack at or above p99 latency");
                }
                if nack_immediately && exactly_once {
                    request.complete(AckResponse::Other);
                } else {
                    self.pending_acks.lock().push(request);
                    self.shared.distribution.record(latency);
                }
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                "ack"
            }
            Reply::Nack | Reply::Dropped | Reply::CallbackFailed => {
                if reply == Reply::Dropped {
                    debug!(ack_id = %ack_id, "ack handle dropped without a decision; nacking");
                }
                self.pending_nacks.lock().push(request);
                self.counters.nacked.fetch_add(1, Ordering::Relaxed);
                "nack"
            }
            Reply::Expired => {
                request.complete(AckResponse::Other);
                // A lease dropped by the tick was already counted there.
                if self.forget(ack_id) {
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                }
                "expired"
            }
        };
        t_counter!("pubsub_dispatch_messages_total", "outcome" => outcome).increment(1);
        self.forget(ack_id);
    }

    /// Drop the lease for `ack_id` and give back its flow control reservation.
    /// Only the first call for an id does anything.
    pub(crate) fn forget(&self, ack_id: &str) -> bool {
        let Some((_, lease)) = self.leases.remove(ack_id) else {
            return false;
        };
        self.shared.flow_controller.release(lease.reserved_bytes);
        self.in_flight.decrement(1);
        true
    }

    fn tick(&self) {
        let now = Instant::now();
        let extension = {
            let mut state = self.state.lock();
            if state.next_extension_at.is_none_or(|at| now >= at) {
                let seconds = self.compute_deadline_seconds(state.exactly_once);
                state.deadline_seconds = seconds;
                let period = Duration::from_secs(seconds.into())
                    .saturating_sub(self.shared.config.ack_expiration_padding);
                state.next_extension_at = Some(now + period);
                Some((seconds, state.exactly_once))
            } else {
                None
            }
        };
        if let Some((seconds, exactly_once)) = extension {
            self.extend_deadlines(now, seconds, exactly_once);
        }
        self.process_outstanding_operations();
        t_gauge!("pubsub_dispatcher_outstanding_leases", "subscription" => self.shared.subscription.clone())
            .set(self.leases.len() as f64);
    }

    pub(crate) fn compute_deadline_seconds(&self, exactly_once: bool) -> u32 {
        let config = &self.shared.config;
        let max = config.max_duration_per_ack_extension.as_secs();
        let mut min = config.effective_min_extension(exactly_once).as_secs();
        if max > 0 {
            min = min.min(max);
        }
        let mut seconds = self.shared.distribution.percentile(DEADLINE_PERCENTILE);
        if max > 0 && seconds > max {
            seconds = max;
        } else if seconds < min {
            seconds = min;
        }
        seconds.clamp(MIN_ACK_DEADLINE.as_secs(), MAX_ACK_DEADLINE.as_secs()) as u32
    }

    /// Modack every lease by `seconds`, or for what is left of it when that
    /// would run past its total expiration.
    fn extend_deadlines(&self, now: Instant, seconds: u32, exactly_once: bool) {
        let extend_to = now + Duration::from_secs(seconds.into());
        let mut by_deadline: BTreeMap<u32, Vec<AckRequest>> = BTreeMap::new();
        let mut lapsing = Vec::new();
        for lease in self.leases.iter() {
            if lease.total_expiration > extend_to {
                by_deadline
                    .entry(seconds)
                    .or_default()
                    .push(AckRequest::new(lease.key().clone()));
            } else {
                lapsing.push((lease.key().clone(), lease.total_expiration));
            }
        }
        for (ack_id, total_expiration) in lapsing {
            if !self.forget(&ack_id) {
                continue;
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            t_counter!("pubsub_lease_expirations_total").increment(1);
            if total_expiration > now {
                let remaining = (total_expiration - now).as_secs().max(1) as u32;
                by_deadline
                    .entry(remaining)
                    .or_default()
                    .push(AckRequest::new(ack_id));
            }
        }

        let count: usize = by_deadline.values().map(Vec::len).sum();
        if count > 0 {
            trace!(subscription = %self.shared.subscription, count, seconds, "extending leases");
        }
        for (deadline_seconds, requests) in by_deadline {
            self.send_modacks(deadline_seconds, requests, false, exactly_once);
        }
    }

    /// Drain nacks, receipts and acks into ack operations.
    pub(crate) fn process_outstanding_operations(&self) {
        let (deadline_seconds, exactly_once, nack_immediately) = {
            let state = self.state.lock();
            (
                state.deadline_seconds,
                state.exactly_once,
                state.nack_immediately,
            )
        };
        let nacks = mem::take(&mut *self.pending_nacks.lock());
        let receipts = mem::take(&mut *self.pending_receipts.lock());
        let acks = mem::take(&mut *self.pending_acks.lock());
        if nacks.is_empty() && receipts.is_empty() && acks.is_empty() {
            return;
        }
        debug!(
            subscription = %self.shared.subscription,
            acks = acks.len(),
            nacks = nacks.len(),
            receipts = receipts.len(),
            exactly_once,
            "sending ack operations"
        );

        if !nacks.is_empty() {
            self.send_modacks(0, nacks, false, exactly_once);
        }
        if nack_immediately {
            for receipt in receipts {
                receipt.complete(AckResponse::Other);
            }
        } else if !receipts.is_empty() {
            self.send_modacks(deadline_seconds, receipts, true, exactly_once);
        }
        for chunk in chunked(acks) {
            self.acks.send(AckOperation::Ack(chunk), exactly_once);
        }
    }

    fn send_modacks(
        &self,
        deadline_seconds: u32,
        requests: Vec<AckRequest>,
        receipt: bool,
        exactly_once: bool,
    ) {
        for chunk in chunked(requests) {
            let modack = ModackRequest {
                deadline_seconds,
                requests: chunk,
                receipt,
            };
            self.acks.send(AckOperation::Modack(modack), exactly_once);
        }
    }

    /// Stop per the configured shutdown mode and flush what is queued.
    pub(crate) async fn stop(&self) {
        let shutdown = self.shared.config.shutdown;
        self.release_gated();
        match shutdown.mode {
            ShutdownMode::WaitForProcessing => {
                debug!(
                    subscription = %self.shared.subscription,
                    outstanding = self.in_flight.pending_count(),
                    "waiting for outstanding messages"
                );
                match shutdown.timeout {
                    None => self.in_flight.wait_complete().await,
                    Some(timeout) => {
                        let grace = timeout.saturating_sub(FINAL_NACK_GRACE);
                        if !self.in_flight.try_wait(grace).await {
                            warn!(
                                subscription = %self.shared.subscription,
                                outstanding = self.in_flight.pending_count(),
                                "shutdown grace period expired; nacking remaining messages"
                            );
                            self.nack_all_outstanding();
                        }
                    }
                }
                self.cancel_tick();
                self.process_outstanding_operations();
            }
            ShutdownMode::NackImmediately => {
                debug!(subscription = %self.shared.subscription, "nacking all outstanding messages");
                self.cancel_tick();
                self.nack_all_outstanding();
                self.process_outstanding_operations();
            }
        }
    }

    /// The stream failed for good: resolve everything queued or leased with
    /// `response` and stop ticking.
    pub(crate) fn abort(&self, response: AckResponse) {
        self.cancel_tick();
        let gated: Vec<GatedDelivery> = {
            let mut state = self.state.lock();
            state.terminal_response = Some(response);
            state.awaiting_receipt.drain(..).collect()
        };
        for gated in gated {
            self.shared
                .flow_controller
                .release(gated.delivery.reserved_bytes);
        }
        let queued = [&self.pending_acks, &self.pending_nacks, &self.pending_receipts]
            .into_iter()
            .flat_map(|queue| mem::take(&mut *queue.lock()));
        for request in queued {
            request.complete(response);
        }
        let leased: Vec<String> = self.leases.iter().map(|lease| lease.key().clone()).collect();
        for ack_id in leased {
            self.forget(&ack_id);
        }
    }

    fn nack_all_outstanding(&self) {
        self.state.lock().nack_immediately = true;
        let leased: Vec<String> = self.leases.iter().map(|lease| lease.key().clone()).collect();
        let mut nacks = Vec::new();
        for ack_id in leased {
            if self.forget(&ack_id) {
                nacks.push(AckRequest::new(ack_id));
            }
        }
        self.counters
            .nacked
            .fetch_add(nacks.len() as u64, Ordering::Relaxed);
        self.pending_nacks.lock().extend(nacks);
    }

    /// Give up on messages still waiting for their receipt and nack them.
    fn release_gated(&self) {
        let gated: Vec<GatedDelivery> = self.state.lock().awaiting_receipt.drain(..).collect();
        if gated.is_empty() {
            return;
        }
        let ids: AHashSet<&str> = gated
            .iter()
            .map(|gated| gated.delivery.ack_id.as_str())
            .collect();
        self.pending_receipts
            .lock()
            .retain(|receipt| !ids.contains(receipt.ack_id.as_str()));
        let mut nacks = Vec::with_capacity(gated.len());
        for gated in &gated {
            self.shared
                .flow_controller
                .release(gated.delivery.reserved_bytes);
            nacks.push(AckRequest::new(gated.delivery.ack_id.clone()));
        }
        self.pending_nacks.lock().extend(nacks);
    }

    fn cancel_tick(&self) {
        if let Some(task) = self.tick.lock().take() {
            task.cancel();
        }
    }
}

fn chunked(mut requests: Vec<AckRequest>) -> Vec<Vec<AckRequest>> {
    let mut chunks = Vec::with_capacity(requests.len().div_ceil(MAX_ACK_IDS_PER_REQUEST));
    while requests.len() > MAX_ACK_IDS_PER_REQUEST {
        let rest = requests.split_off(MAX_ACK_IDS_PER_REQUEST);
        chunks.push(mem::replace(&mut requests, rest));
    }
    if !requests.is_empty() {
        chunks.push(requests);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowControlBehavior, FlowControlConfig, ShutdownConfig};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Sent {
        kind: &'static str,
        deadline: Option<u32>,
        ids: Vec<String>,
    }

    /// Records operations and answers each id from a table (default: success).
    #[derive(Default)]
    struct RecordingAcks {
        sent: Mutex<Vec<Sent>>,
        answers: Mutex<HashMap<String, AckResponse>>,
    }

    impl RecordingAcks {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }

        fn sent_of(&self, kind: &str) -> Vec<Sent> {
            self.sent().into_iter().filter(|s| s.kind == kind).collect()
        }
    }

    impl AckProcessor for RecordingAcks {
        fn send(&self, operation: AckOperation, _exactly_once: bool) {
            let kind = operation.kind();
            let (deadline, requests) = match operation {
                AckOperation::Ack(requests) => (None, requests),
                AckOperation::Modack(modack) => (Some(modack.deadline_seconds), modack.requests),
            };
            let ids = requests.iter().map(|r| r.ack_id.clone()).collect();
            self.sent.lock().push(Sent {
                kind,
                deadline,
                ids,
            });
            let answers = self.answers.lock();
            for request in requests {
                let answer = answers
                    .get(&request.ack_id)
                    .copied()
                    .unwrap_or(AckResponse::Successful);
                request.complete(answer);
            }
        }
    }

    /// Hands every delivery to the test.
    struct ChannelReceiver(mpsc::UnboundedSender<(ReceivedPubsubMessage, AckHandle)>);

    #[async_trait]
    impl MessageReceiver for ChannelReceiver {
        async fn receive(&self, message: ReceivedPubsubMessage, ack: AckHandle) -> anyhow::Result<()> {
            let _ = self.0.send((message, ack));
            Ok(())
        }
    }

    struct FailingReceiver;

    #[async_trait]
    impl MessageReceiver for FailingReceiver {
        async fn receive(&self, _message: ReceivedPubsubMessage, _ack: AckHandle) -> anyhow::Result<()> {
            anyhow::bail!("cannot handle this")
        }
    }

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        acks: Arc<RecordingAcks>,
        flow: Arc<FlowController>,
        distribution: Arc<Distribution>,
    }

    fn fixture(config: SubscriberConfig, receiver: Arc<dyn MessageReceiver>) -> Fixture {
        let flow = Arc::new(FlowController::new(&config.flow_control));
        let distribution = Arc::new(Distribution::new(MAX_ACK_DEADLINE.as_secs() as usize));
        let callbacks = Arc::new(Semaphore::new(config.callback_concurrency()));
        let shared = DispatchShared {
            subscription: "projects/p/subscriptions/s".into(),
            config: Arc::new(config),
            receiver,
            flow_controller: Arc::clone(&flow),
            distribution: Arc::clone(&distribution),
            callbacks,
            scheduler: Scheduler::current().expect("runtime"),
        };
        let acks = Arc::new(RecordingAcks::default());
        let dispatcher = Dispatcher::new(shared, Arc::clone(&acks) as Arc<dyn AckProcessor>);
        dispatcher.start();
        Fixture {
            dispatcher,
            acks,
            flow,
            distribution,
        }
    }

    fn channel_receiver() -> (
        Arc<dyn MessageReceiver>,
        mpsc::UnboundedReceiver<(ReceivedPubsubMessage, AckHandle)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelReceiver(tx)), rx)
    }

    fn received(ack_id: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.into(),
            message: PubsubMessage::new(format!("payload-{ack_id}")),
            delivery_attempt: 0,
        }
    }

    fn config() -> SubscriberConfig {
        SubscriberConfig {
            flow_control: FlowControlConfig::bounded(100, 1_000_000, FlowControlBehavior::Block),
            ..SubscriberConfig::default()
        }
    }

    async fn next_tick() {
        tokio::time::sleep(TICK_INTERVAL + Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_and_ack_go_out_on_the_tick() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.dispatcher.process_received(vec![received("m1")]).await;
        assert_eq!(f.flow.stats().outstanding_elements, 1);

        let (message, handle) = deliveries.recv().await.expect("delivery");
        assert_eq!(message.ack_id(), "m1");
        assert_eq!(handle.ack().await, AckResponse::Successful);
        next_tick().await;

        assert_eq!(
            f.acks.sent_of("receipt"),
            vec![Sent {
                kind: "receipt",
                deadline: Some(10),
                ids: vec!["m1".into()],
            }]
        );
        assert_eq!(f.acks.sent_of("ack")[0].ids, vec!["m1".to_string()]);
        assert_eq!(f.flow.stats().outstanding_elements, 0);
        assert_eq!(f.dispatcher.stats().outstanding_leases, 0);
        assert_eq!(f.distribution.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn extension_is_clamped_up_to_configured_minimum() {
        let (receiver, mut deliveries) = channel_receiver();
        let mut config = config();
        config.min_duration_per_ack_extension = Duration::from_secs(20);
        let f = fixture(config, receiver);
        f.distribution.record(15);

        f.dispatcher.process_received(vec![received("m1")]).await;
        let _held = deliveries.recv().await.expect("delivery");
        next_tick().await;

        assert_eq!(f.dispatcher.deadline_seconds(), 20);
        assert!(f.acks.sent_of("modack").contains(&Sent {
            kind: "modack",
            deadline: Some(20),
            ids: vec!["m1".into()],
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn lapsing_lease_gets_one_final_modack_for_its_remaining_time() {
        let (receiver, mut deliveries) = channel_receiver();
        let mut config = config();
        config.max_ack_extension_period = Duration::from_secs(5);
        config.min_duration_per_ack_extension = Duration::from_secs(60);
        let f = fixture(config, receiver);

        f.dispatcher.process_received(vec![received("m2")]).await;
        let _held = deliveries.recv().await.expect("delivery");
        next_tick().await;

        let modacks = f.acks.sent_of("modack");
        assert_eq!(modacks.len(), 1);
        assert_eq!(modacks[0].ids, vec!["m2".to_string()]);
        let deadline = modacks[0].deadline.expect("deadline");
        assert!((4..=5).contains(&deadline), "final modack was {deadline}s");
        assert_eq!(f.dispatcher.stats().outstanding_leases, 0);
        assert_eq!(f.dispatcher.stats().expired, 1);
        assert_eq!(f.flow.stats().outstanding_elements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_releases_flow_control_once() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.dispatcher
            .process_received(vec![received("m1"), received("m2")])
            .await;
        let _first = deliveries.recv().await.expect("delivery");
        let _second = deliveries.recv().await.expect("delivery");
        let before = f.flow.stats();
        assert_eq!(before.outstanding_elements, 2);

        assert!(f.dispatcher.forget("m1"));
        assert!(!f.dispatcher.forget("m1"));
        let after = f.flow.stats();
        assert_eq!(after.outstanding_elements, 1);
        assert!(after.outstanding_bytes > 0);
        assert_eq!(f.dispatcher.stats().outstanding_leases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ack_id_is_neither_delivered_nor_nacked() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.dispatcher
            .process_received(vec![received("m1"), received("m1")])
            .await;
        let _held = deliveries.recv().await.expect("delivery");
        next_tick().await;

        assert!(deliveries.try_recv().is_err());
        assert_eq!(f.acks.sent_of("receipt")[0].ids, vec!["m1".to_string()]);
        assert!(f.acks.sent_of("nack").is_empty());
        assert_eq!(f.flow.stats().outstanding_elements, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_error_counts_as_nack() {
        let f = fixture(config(), Arc::new(FailingReceiver));
        f.dispatcher.process_received(vec![received("m1")]).await;
        next_tick().await;

        assert_eq!(
            f.acks.sent_of("nack"),
            vec![Sent {
                kind: "nack",
                deadline: Some(0),
                ids: vec!["m1".into()],
            }]
        );
        assert_eq!(f.dispatcher.stats().nacked, 1);
        assert_eq!(f.flow.stats().outstanding_elements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_counts_as_nack() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.dispatcher.process_received(vec![received("m1")]).await;
        drop(deliveries.recv().await.expect("delivery"));
        next_tick().await;
        assert_eq!(f.acks.sent_of("nack")[0].ids, vec!["m1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_delivers_only_after_successful_receipt() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.acks
            .answers
            .lock()
            .insert("bad".into(), AckResponse::Invalid);
        f.dispatcher.set_exactly_once(true);

        f.dispatcher
            .process_received(vec![received("good"), received("bad")])
            .await;
        assert!(deliveries.try_recv().is_err());
        next_tick().await;

        let (message, _handle) = deliveries.recv().await.expect("delivery");
        assert_eq!(message.ack_id(), "good");
        tokio::task::yield_now().await;
        assert!(deliveries.try_recv().is_err());
        assert_eq!(f.dispatcher.stats().outstanding_leases, 1);
        assert_eq!(f.flow.stats().outstanding_elements, 1);
        // Exactly-once raises the unset minimum extension to 60s.
        assert_eq!(f.dispatcher.deadline_seconds(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_duplicate_sends_no_second_receipt() {
        let (receiver, mut deliveries) = channel_receiver();
        let f = fixture(config(), receiver);
        f.dispatcher.set_exactly_once(true);

        f.dispatcher
            .process_received(vec![received("m1"), received("m1")])
            .await;
        next_tick().await;
        let _held = deliveries.recv().await.expect("delivery");
        // Redelivered while leased.
        f.dispatcher.process_received(vec![received("m1")]).await;
        next_tick().await;

        let receipts: Vec<String> = f
            .acks
            .sent_of("receipt")
            .into_iter()
            .flat_map(|sent| sent.ids)
            .collect();
        assert_eq!(receipts, vec!["m1".to_string()]);
        assert!(deliveries.try_recv().is_err());
        assert_eq!(f.flow.stats().outstanding_elements, 1);
        assert_eq!(f.dispatcher.stats().outstanding_leases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_ack_resolves_with_terminal_response_after_abort() {
        let (receiver, mut deliveries) = channel_receiver();
        let mut config = config();
        config.track_ack_responses = true;
        let f = fixture(config, receiver);
        f.dispatcher
            .process_received(vec![received("m1"), received("m2")])
            .await;
        let (_, first) = deliveries.recv().await.expect("delivery");
        let (_, second) = deliveries.recv().await.expect("delivery");

        let queued = first.ack();
        tokio::time::sleep(Duration::from_millis(1)).await;
        f.dispatcher.abort(AckResponse::PermissionDenied);
        assert_eq!(queued.await, AckResponse::PermissionDenied);
        assert_eq!(second.ack().await, AckResponse::PermissionDenied);
        assert_eq!(f.flow.stats().outstanding_elements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_immediately_shutdown_nacks_outstanding_leases() {
        let (receiver, mut deliveries) = channel_receiver();
        let mut config = config();
        config.shutdown = ShutdownConfig {
            mode: ShutdownMode::NackImmediately,
            timeout: None,
        };
        let f = fixture(config, receiver);
        f.dispatcher.process_received(vec![received("m1")]).await;
        let _held = deliveries.recv().await.expect("delivery");

        f.dispatcher.stop().await;
        assert_eq!(f.acks.sent_of("nack")[0].ids, vec!["m1".to_string()]);
        assert_eq!(f.dispatcher.stats().outstanding_leases, 0);
        assert_eq!(f.flow.stats().outstanding_elements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_shutdown_nacks_what_is_left() {
        let (receiver, mut deliveries) = channel_receiver();
        let mut config = config();
        config.shutdown = ShutdownConfig {
            mode: ShutdownMode::WaitForProcessing,
            timeout: Some(Duration::from_secs(3)),
        };
        let f = fixture(config, receiver);
        f.dispatcher
            .process_received(vec![received("done"), received("stuck")])
            .await;
        let (_, done) = deliveries.recv().await.expect("delivery");
        let _stuck = deliveries.recv().await.expect("delivery");
        let _ = done.ack();

        let started = Instant::now();
        f.dispatcher.stop().await;
        assert!(started.elapsed() >= Duration::from_secs(2));
        let nacked: Vec<String> = f
            .acks
            .sent_of("nack")
            .into_iter()
            .flat_map(|s| s.ids)
            .collect();
        assert_eq!(nacked, vec!["stuck".to_string()]);
        let acked: Vec<String> = f
            .acks
            .sent_of("ack")
            .into_iter()
            .flat_map(|s| s.ids)
            .collect();
        assert_eq!(acked, vec!["done".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_messages_reach_receiver_one_at_a_time() {
        struct SlowRecorder(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl MessageReceiver for SlowRecorder {
            async fn receive(&self, message: ReceivedPubsubMessage, ack: AckHandle) -> anyhow::Result<()> {
                let index: u64 = message.ack_id().trim_start_matches('m').parse()?;
                tokio::time::sleep(Duration::from_millis(50 - index * 10)).await;
                self.0.lock().push(message.ack_id().to_string());
                let _ = ack.ack();
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let f = fixture(config(), Arc::new(SlowRecorder(Arc::clone(&log))));
        f.dispatcher.set_message_ordering(true);
        let batch = (0..5)
            .map(|i| ReceivedMessage {
                ack_id: format!("m{i}"),
                message: PubsubMessage::new("x").with_ordering_key("key"),
                delivery_attempt: 0,
            })
            .collect();
        f.dispatcher.process_received(batch).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*log.lock(), vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn message_expired_while_waiting_is_skipped_silently() {
        struct BlockFirst(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl MessageReceiver for BlockFirst {
            async fn receive(&self, message: ReceivedPubsubMessage, ack: AckHandle) -> anyhow::Result<()> {
                self.0.lock().push(message.ack_id().to_string());
                tokio::time::sleep(Duration::from_secs(30)).await;
                let _ = ack.ack();
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut config = config();
        config.max_concurrent_callbacks = Some(1);
        config.max_ack_extension_period = Duration::ZERO;
        let f = fixture(config, Arc::new(BlockFirst(Arc::clone(&log))));
        f.dispatcher
            .process_received(vec![received("m1"), received("m2")])
            .await;
        tokio::time::sleep(Duration::from_secs(40)).await;

        assert_eq!(*log.lock(), vec!["m1"]);
        assert!(f.acks.sent_of("nack").is_empty());
        assert_eq!(f.dispatcher.stats().expired, 2);
    }

    #[test]
    fn chunking_respects_request_limit() {
        let requests = (0..2_500).map(|i| AckRequest::new(i.to_string())).collect();
        let sizes: Vec<usize> = chunked(requests).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert!(chunked(Vec::new()).is_empty());
    }
}
