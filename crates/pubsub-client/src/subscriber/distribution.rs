// Ack-latency histogram with one bucket per whole second.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub(crate) struct Distribution {
    buckets: Box<[AtomicU64]>,
    count: AtomicU64,
}

impl Distribution {
    /// Values above `max_value` land in the last bucket.
    pub(crate) fn new(max_value: usize) -> Self {
        Self {
            buckets: (0..=max_value).map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
        }
    }

    pub(crate) fn record(&self, value: u64) {
        let index = (value as usize).min(self.buckets.len() - 1);
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Smallest value whose cumulative count reaches `percentile` of all samples.
    /// Zero when nothing has been recorded.
    pub(crate) fn percentile(&self, percentile: f64) -> u64 {
        let target = (percentile * self.count() as f64 / 100.0).ceil() as u64;
        let mut rank = 0;
        for (value, bucket) in self.buckets.iter().enumerate() {
            rank += bucket.load(Ordering::Relaxed);
            if rank >= target {
                return value as u64;
            }
        }
        self.buckets.len() as u64
    }
}
