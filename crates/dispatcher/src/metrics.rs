//! Sink metrics for observability

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

/// Metrics for a single sink
#[derive(Debug, Default)]
pub struct SinkMetrics {
    /// Current queue length
    queue_len: AtomicUsize,
    /// Frames the sink accepted
    delivered_count: AtomicU64,
    /// Frames the sink returned an error for
    failure_count: AtomicU64,
    /// Frames dropped because the queue was full
    dropped_count: AtomicU64,
}

impl SinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Relaxed);
    }

    pub fn delivered_count(&self) -> u64 {
        self.delivered_count.load(Ordering::Relaxed)
    }

    pub fn inc_delivered_count(&self) {
        self.delivered_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn inc_failure_count(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped_count.load(Ordering::Relaxed)
    }

    pub fn inc_dropped_count(&self) {
        self.dropped_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_dropped_count(&self, frames: u64) {
        self.dropped_count.fetch_add(frames, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_len: self.queue_len(),
            delivered_count: self.delivered_count(),
            failure_count: self.failure_count(),
            dropped_count: self.dropped_count(),
        }
    }
}

/// Snapshot of sink metrics (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queue_len: usize,
    pub delivered_count: u64,
    pub failure_count: u64,
    pub dropped_count: u64,
}

impl MetricsSnapshot {
    /// Frames that reached the sink worker or were dropped in front of it
    pub fn total(&self) -> u64 {
        self.delivered_count + self.failure_count + self.dropped_count
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivered={} failed={} dropped={} queued={}",
            self.delivered_count, self.failure_count, self.dropped_count, self.queue_len
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = SinkMetrics::new();
        metrics.inc_delivered_count();
        metrics.inc_delivered_count();
        metrics.inc_failure_count();
        metrics.inc_dropped_count();
        metrics.set_queue_len(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total(), 4);
        assert_eq!(snapshot.to_string(), "delivered=2 failed=1 dropped=1 queued=3");
    }

    #[test]
    fn test_snapshot_serializes_for_reports() {
        let snapshot = MetricsSnapshot {
            delivered_count: 7,
            ..Default::default()
        };
        let value = serde_json::to_value(snapshot).unwrap();
        assert_eq!(value["delivered_count"], 7);
        assert_eq!(value["dropped_count"], 0);
    }
}
