//! Admission gate bounding outstanding element count and bytes.
//!
//! # Purpose
//! Publishers acquire before batching and release once a message's outcome is
//! known; subscribers acquire per received message and release when the lease
//! is forgotten. Under `Block` the caller waits, which is how backpressure
//! reaches whoever is producing.
//!
//! # Design notes
//! - One mutex guards both counters and both wait lines.
//! - Element waiters and byte waiters queue separately. A byte waiter may take
//!   capacity in several installments; after the first wake it requeues at the
//!   front so later arrivals never starve it.
//! - New arrivals queue behind existing waiters instead of grabbing freshly
//!   released capacity, so at most the head waiter holds a partial reservation.
//! - An acquire future dropped mid-wait gives back whatever it had reserved.
use crate::config::{FlowControlBehavior, FlowControlConfig};
use crate::error::FlowControlError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug)]
pub struct FlowController {
    max_elements: Option<u64>,
    max_bytes: Option<u64>,
    behavior: FlowControlBehavior,
    state: Mutex<FlowState>,
}

#[derive(Debug, Default)]
struct FlowState {
    outstanding_elements: u64,
    outstanding_bytes: u64,
    element_waiters: VecDeque<oneshot::Sender<()>>,
    byte_waiters: VecDeque<oneshot::Sender<()>>,
}

impl FlowState {
    fn wake_one(queue: &mut VecDeque<oneshot::Sender<()>>) {
        // Skip waiters whose acquire future has already gone away.
        while let Some(waiter) = queue.pop_front() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
    }
}

/// Counts reserved so far by one in-progress acquire.
struct Reservation<'a> {
    controller: &'a FlowController,
    elements: u64,
    bytes: u64,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.controller.state.lock();
        state.outstanding_elements = state.outstanding_elements.saturating_sub(self.elements);
        state.outstanding_bytes = state.outstanding_bytes.saturating_sub(self.bytes);
        // This acquire may have consumed a wake-up it will never act on.
        FlowState::wake_one(&mut state.element_waiters);
        FlowState::wake_one(&mut state.byte_waiters);
    }
}

/// Snapshot of the gate's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowControlStats {
    pub outstanding_elements: u64,
    pub outstanding_bytes: u64,
    pub waiting_for_elements: usize,
    pub waiting_for_bytes: usize,
}

impl FlowController {
    pub fn new(config: &FlowControlConfig) -> Self {
        Self {
            max_elements: config.max_outstanding_elements,
            max_bytes: config.max_outstanding_bytes,
            behavior: config.behavior,
            state: Mutex::new(FlowState::default()),
        }
    }

    pub fn behavior(&self) -> FlowControlBehavior {
        self.behavior
    }

    pub fn max_outstanding_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    pub fn max_outstanding_elements(&self) -> Option<u64> {
        self.max_elements
    }

    /// Reserve one element slot and `size` bytes.
    pub async fn acquire(&self, size: u64) -> Result<(), FlowControlError> {
        if let Some(limit) = self.max_bytes
            && size > limit
        {
            return Err(FlowControlError::RequestTooLarge { size, limit });
        }
        match self.behavior {
            FlowControlBehavior::Ignore => Ok(()),
            FlowControlBehavior::Reject => self.try_reserve(size),
            FlowControlBehavior::Block => {
                self.reserve_blocking(size).await;
                Ok(())
            }
        }
    }

    /// Give back one element slot and `size` bytes.
    pub fn release(&self, size: u64) {
        if self.behavior == FlowControlBehavior::Ignore {
            return;
        }
        let mut state = self.state.lock();
        state.outstanding_elements = state.outstanding_elements.saturating_sub(1);
        state.outstanding_bytes = state.outstanding_bytes.saturating_sub(size);
        FlowState::wake_one(&mut state.element_waiters);
        FlowState::wake_one(&mut state.byte_waiters);
    }

    pub fn stats(&self) -> FlowControlStats {
        let state = self.state.lock();
        FlowControlStats {
            outstanding_elements: state.outstanding_elements,
            outstanding_bytes: state.outstanding_bytes,
            waiting_for_elements: state.element_waiters.len(),
            waiting_for_bytes: state.byte_waiters.len(),
        }
    }

    fn try_reserve(&self, size: u64) -> Result<(), FlowControlError> {
        let mut state = self.state.lock();
        if let Some(limit) = self.max_elements
            && state.outstanding_elements >= limit
        {
            return Err(FlowControlError::MaxOutstandingElementsReached { limit });
        }
        if let Some(limit) = self.max_bytes
            && state.outstanding_bytes + size > limit
        {
            return Err(FlowControlError::MaxOutstandingBytesReached { limit });
        }
        state.outstanding_elements += 1;
        state.outstanding_bytes += size;
        Ok(())
    }

    async fn reserve_blocking(&self, size: u64) {
        let started = Instant::now();
        let mut waited = false;
        let mut reservation = Reservation {
            controller: self,
            elements: 0,
            bytes: 0,
            committed: false,
        };

        let mut requeue_front = false;
        loop {
            let wake = {
                let mut state = self.state.lock();
                let has_room = self
                    .max_elements
                    .is_none_or(|limit| state.outstanding_elements < limit);
                let must_queue = !requeue_front && !state.element_waiters.is_empty();
                if has_room && !must_queue {
                    state.outstanding_elements += 1;
                    reservation.elements = 1;
                    // Capacity may remain for whoever is next in line.
                    if self
                        .max_elements
                        .is_none_or(|limit| state.outstanding_elements < limit)
                    {
                        FlowState::wake_one(&mut state.element_waiters);
                    }
                    break;
                }
                let (tx, rx) = oneshot::channel();
                if requeue_front {
                    state.element_waiters.push_front(tx);
                } else {
                    state.element_waiters.push_back(tx);
                }
                rx
            };
            waited = true;
            trace!(size, "flow control waiting for an element slot");
            let _ = wake.await;
            requeue_front = true;
        }

        let mut remaining = size;
        let mut requeue_front = false;
        loop {
            let wake = {
                let mut state = self.state.lock();
                let must_queue = !requeue_front && !state.byte_waiters.is_empty();
                if !must_queue {
                    let available = match self.max_bytes {
                        Some(limit) => limit.saturating_sub(state.outstanding_bytes),
                        None => remaining,
                    };
                    let take = available.min(remaining);
                    state.outstanding_bytes += take;
                    reservation.bytes += take;
                    remaining -= take;
                    if remaining == 0 {
                        if self
                            .max_bytes
                            .is_none_or(|limit| state.outstanding_bytes < limit)
                        {
                            FlowState::wake_one(&mut state.byte_waiters);
                        }
                        break;
                    }
                }
                let (tx, rx) = oneshot::channel();
                if requeue_front {
                    state.byte_waiters.push_front(tx);
                } else {
                    state.byte_waiters.push_back(tx);
                }
                rx
            };
            waited = true;
            trace!(size, remaining, "flow control waiting for bytes");
            let _ = wake.await;
            requeue_front = true;
        }

        reservation.committed = true;
        if waited {
            t_histogram!("pubsub_flow_control_wait_ns").record(started.elapsed().as_nanos() as f64);
        }
    }
}
