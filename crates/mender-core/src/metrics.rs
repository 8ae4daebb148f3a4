//! Per-pipeline atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`PipelineMetrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at shutdown or on a daemon tick).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::queue::DropCounter;

/// A single monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters shared by every stage of one pipeline instance.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub lines_read: Counter,
    pub events_detected: Counter,
    pub events_analyzed: Counter,
    pub files_lost: Counter,
    pub io_errors: Counter,
    pub watcher_errors: Counter,
    pub snippet_failures: Counter,
    pub fixes_generated: Counter,
    pub fixes_exhausted: Counter,
    pub events_requeued: Counter,
    pub strategy_timeouts: Counter,
    pub fixes_suggested: Counter,
    pub fixes_deployed: Counter,
    pub fixes_verified: Counter,
    pub fixes_failed: Counter,
    pub fixes_rolled_back: Counter,
    pub deferred_dropped: Counter,
    pub patterns_observed: Counter,
    pub patterns_pruned: Counter,
    pub persist_errors: Counter,
    queues: Mutex<Vec<DropCounter>>,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub lines_read: u64,
    pub events_detected: u64,
    pub events_analyzed: u64,
    pub files_lost: u64,
    pub io_errors: u64,
    pub watcher_errors: u64,
    pub snippet_failures: u64,
    pub fixes_generated: u64,
    pub fixes_exhausted: u64,
    pub events_requeued: u64,
    pub strategy_timeouts: u64,
    pub fixes_suggested: u64,
    pub fixes_deployed: u64,
    pub fixes_verified: u64,
    pub fixes_failed: u64,
    pub fixes_rolled_back: u64,
    pub deferred_dropped: u64,
    pub patterns_observed: u64,
    pub patterns_pruned: u64,
    pub persist_errors: u64,
    /// Queue name -> items dropped because the queue was full.
    pub queue_drops: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    pub fn total_queue_drops(&self) -> u64 {
        self.queue_drops.values().sum()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include a queue's drop counter in snapshots.
    pub fn register_queue(&self, counter: DropCounter) {
        self.queues.lock().push(counter);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut queue_drops = BTreeMap::new();
        for q in self.queues.lock().iter() {
            *queue_drops.entry(q.name().to_string()).or_insert(0) += q.get();
        }
        MetricsSnapshot {
            lines_read: self.lines_read.get(),
            events_detected: self.events_detected.get(),
            events_analyzed: self.events_analyzed.get(),
            files_lost: self.files_lost.get(),
            io_errors: self.io_errors.get(),
            watcher_errors: self.watcher_errors.get(),
            snippet_failures: self.snippet_failures.get(),
            fixes_generated: self.fixes_generated.get(),
            fixes_exhausted: self.fixes_exhausted.get(),
            events_requeued: self.events_requeued.get(),
            strategy_timeouts: self.strategy_timeouts.get(),
            fixes_suggested: self.fixes_suggested.get(),
            fixes_deployed: self.fixes_deployed.get(),
            fixes_verified: self.fixes_verified.get(),
            fixes_failed: self.fixes_failed.get(),
            fixes_rolled_back: self.fixes_rolled_back.get(),
            deferred_dropped: self.deferred_dropped.get(),
            patterns_observed: self.patterns_observed.get(),
            patterns_pruned: self.patterns_pruned.get(),
            persist_errors: self.persist_errors.get(),
            queue_drops,
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            lines_read = s.lines_read,
            events_detected = s.events_detected,
            events_analyzed = s.events_analyzed,
            fixes_generated = s.fixes_generated,
            fixes_exhausted = s.fixes_exhausted,
            fixes_suggested = s.fixes_suggested,
            fixes_verified = s.fixes_verified,
            fixes_failed = s.fixes_failed,
            fixes_rolled_back = s.fixes_rolled_back,
            patterns_observed = s.patterns_observed,
            persist_errors = s.persist_errors,
            queue_drops = s.total_queue_drops(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::bounded;

    #[test]
    fn counters_increment() {
        let m = PipelineMetrics::new();
        assert_eq!(m.lines_read.get(), 0);
        m.lines_read.inc();
        m.lines_read.add(2);
        m.fixes_verified.inc();
        let s = m.snapshot();
        assert_eq!(s.lines_read, 3);
        assert_eq!(s.fixes_verified, 1);
        assert_eq!(s.fixes_failed, 0);
    }

    #[tokio::test]
    async fn snapshot_includes_queue_drops() {
        let m = PipelineMetrics::new();
        let (tx, _rx) = bounded::<u8>("collector.out", 1);
        m.register_queue(tx.drop_counter());
        tx.publish(1);
        tx.publish(2);
        tx.publish(3);
        let s = m.snapshot();
        assert_eq!(s.queue_drops.get("collector.out"), Some(&2));
        assert_eq!(s.total_queue_drops(), 2);
    }
}
