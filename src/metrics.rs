use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A counter that can be incremented and decremented concurrently.
#[derive(Debug, Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn inc(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn dec(&self, delta: i64) {
        self.0.fetch_sub(delta, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Store-wide counters. All fields are safe for concurrent use; reads are
/// approximate while writers are active.
#[derive(Debug, Default)]
pub struct Metrics {
    pub puts: Counter,
    pub dels: Counter,
    pub gets: Counter,
    pub syncs: Counter,
    pub recovers: Counter,
    pub in_msgs: Counter,
    pub in_bytes: Counter,
    pub block_probes: Counter,
    pub aborts: Counter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            puts: self.puts.value(),
            dels: self.dels.value(),
            gets: self.gets.value(),
            syncs: self.syncs.value(),
            recovers: self.recovers.value(),
            in_msgs: self.in_msgs.value(),
            in_bytes: self.in_bytes.value(),
            block_probes: self.block_probes.value(),
            aborts: self.aborts.value(),
        }
    }
}

/// Read-only copy of the store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub puts: i64,
    pub dels: i64,
    pub gets: i64,
    pub syncs: i64,
    pub recovers: i64,
    pub in_msgs: i64,
    pub in_bytes: i64,
    pub block_probes: i64,
    pub aborts: i64,
}
