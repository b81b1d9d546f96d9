//! Run-scoped counters for the two-level cache
//!
//! One `CacheMetrics` is created per cache instance and shared with its
//! spill worker; there is no process-wide metrics state.

use crate::message::ControlMessage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cheaply cloneable handle to the run's counters
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    pub(crate) inner: Arc<MetricsInner>,
}

#[derive(Debug)]
pub(crate) struct MetricsInner {
    // Write pass
    batches_written: AtomicU64,
    items_enqueued: AtomicU64,
    items_dropped: AtomicU64,

    // Read pass
    cache_hits: AtomicU64,
    recomputes: AtomicU64,
    wait_timeouts: AtomicU64,
    recovered_misses: AtomicU64,
    total_wait_ns: AtomicU64,

    // Control messages
    writing_messages: AtomicU64,
    host_full_messages: AtomicU64,
    disk_full_messages: AtomicU64,
    reading_messages: AtomicU64,

    // Disk tier
    chunks_spilled: AtomicU64,
    bytes_spilled: AtomicU64,
    chunks_loaded: AtomicU64,
    bytes_loaded: AtomicU64,
    spill_failures: AtomicU64,
    load_failures: AtomicU64,

    start_time: Instant,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub batches_written: u64,
    pub items_enqueued: u64,
    pub items_dropped: u64,
    pub cache_hits: u64,
    pub recomputes: u64,
    pub wait_timeouts: u64,
    pub recovered_misses: u64,
    pub total_wait_ms: u64,
    pub writing_messages: u64,
    pub host_full_messages: u64,
    pub disk_full_messages: u64,
    pub reading_messages: u64,
    pub chunks_spilled: u64,
    pub bytes_spilled: u64,
    pub chunks_loaded: u64,
    pub bytes_loaded: u64,
    pub spill_failures: u64,
    pub load_failures: u64,
    pub uptime_ms: u64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                batches_written: AtomicU64::new(0),
                items_enqueued: AtomicU64::new(0),
                items_dropped: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                recomputes: AtomicU64::new(0),
                wait_timeouts: AtomicU64::new(0),
                recovered_misses: AtomicU64::new(0),
                total_wait_ns: AtomicU64::new(0),
                writing_messages: AtomicU64::new(0),
                host_full_messages: AtomicU64::new(0),
                disk_full_messages: AtomicU64::new(0),
                reading_messages: AtomicU64::new(0),
                chunks_spilled: AtomicU64::new(0),
                bytes_spilled: AtomicU64::new(0),
                chunks_loaded: AtomicU64::new(0),
                bytes_loaded: AtomicU64::new(0),
                spill_failures: AtomicU64::new(0),
                load_failures: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_write(&self, enqueued: bool) {
        self.inner.batches_written.fetch_add(1, Ordering::Relaxed);
        if enqueued {
            self.inner.items_enqueued.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, items: u64) {
        self.inner.items_dropped.fetch_add(items, Ordering::Relaxed);
    }

    pub fn record_hit(&self, waited: Duration) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        self.record_wait(waited);
    }

    pub fn record_recompute(&self) {
        self.inner.recomputes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_wait_timeout(&self, waited: Duration) {
        self.inner.wait_timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_wait(waited);
    }

    pub fn record_recovered_miss(&self) {
        self.inner.recovered_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_wait(&self, waited: Duration) {
        self.inner
            .total_wait_ns
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_message(&self, message: &ControlMessage) {
        let counter = match message {
            ControlMessage::Writing(_) => &self.inner.writing_messages,
            ControlMessage::WritingHostMemoryFull(_) => &self.inner.host_full_messages,
            ControlMessage::WritingDiskMemoryFull(_) => &self.inner.disk_full_messages,
            ControlMessage::Reading(_) => &self.inner.reading_messages,
            ControlMessage::Terminate(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spill(&self, bytes: u64) {
        self.inner.chunks_spilled.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_spilled.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_load(&self, bytes: u64) {
        self.inner.chunks_loaded.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_spill_failure(&self) {
        self.inner.spill_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_failure(&self) {
        self.inner.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSnapshot {
            batches_written: load(&inner.batches_written),
            items_enqueued: load(&inner.items_enqueued),
            items_dropped: load(&inner.items_dropped),
            cache_hits: load(&inner.cache_hits),
            recomputes: load(&inner.recomputes),
            wait_timeouts: load(&inner.wait_timeouts),
            recovered_misses: load(&inner.recovered_misses),
            total_wait_ms: load(&inner.total_wait_ns) / 1_000_000,
            writing_messages: load(&inner.writing_messages),
            host_full_messages: load(&inner.host_full_messages),
            disk_full_messages: load(&inner.disk_full_messages),
            reading_messages: load(&inner.reading_messages),
            chunks_spilled: load(&inner.chunks_spilled),
            bytes_spilled: load(&inner.bytes_spilled),
            chunks_loaded: load(&inner.chunks_loaded),
            bytes_loaded: load(&inner.bytes_loaded),
            spill_failures: load(&inner.spill_failures),
            load_failures: load(&inner.load_failures),
            uptime_ms: inner.start_time.elapsed().as_millis() as u64,
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSnapshot {
    /// Fraction of reads served from the cache tiers
    pub fn hit_rate(&self) -> f64 {
        let reads = self.cache_hits + self.recomputes;
        if reads == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / reads as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ChunkPosition;

    #[test]
    fn test_clones_share_counters() {
        let metrics = CacheMetrics::new();
        let worker_side = metrics.clone();

        metrics.record_write(true);
        metrics.record_write(false);
        worker_side.record_spill(128);
        worker_side.record_load(128);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.batches_written, 2);
        assert_eq!(snapshot.items_enqueued, 1);
        assert_eq!(snapshot.chunks_spilled, 1);
        assert_eq!(snapshot.bytes_loaded, 128);
    }

    #[test]
    fn test_message_counters() {
        let metrics = CacheMetrics::new();
        let position = ChunkPosition::new(0, 1);
        metrics.record_message(&ControlMessage::Writing(position));
        metrics.record_message(&ControlMessage::Reading(position));
        metrics.record_message(&ControlMessage::Terminate(position));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.writing_messages, 1);
        assert_eq!(snapshot.reading_messages, 1);
        assert_eq!(snapshot.host_full_messages, 0);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.snapshot().hit_rate(), 0.0);
        metrics.record_hit(Duration::ZERO);
        metrics.record_hit(Duration::ZERO);
        metrics.record_hit(Duration::ZERO);
        metrics.record_recompute();
        assert!((metrics.snapshot().hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
