//! # Metrics
//!
//! Lock-free counters describing lookup and override traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Read path
    lookups: AtomicU64,
    lookup_misses: AtomicU64,
    heap_hits: AtomicU64,
    file_reads: AtomicU64,
    bytes_served: AtomicU64,

    // Write path
    overrides_set: AtomicU64,
    overrides_dropped: AtomicU64,
    delta_saves: AtomicU64,

    // Databases
    databases_loaded: AtomicU64,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lookup(&self) {
        self.inner.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.inner.lookup_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heap_hit(&self) {
        self.inner.heap_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_file_read(&self) {
        self.inner.file_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_served(&self, bytes: u64) {
        self.inner.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_overrides(&self, applied: u64, dropped: u64) {
        self.inner.overrides_set.fetch_add(applied, Ordering::Relaxed);
        self.inner.overrides_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_delta_save(&self) {
        self.inner.delta_saves.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_databases(&self, count: u64) {
        self.inner.databases_loaded.store(count, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            lookups: self.inner.lookups.load(Ordering::Relaxed),
            lookup_misses: self.inner.lookup_misses.load(Ordering::Relaxed),
            heap_hits: self.inner.heap_hits.load(Ordering::Relaxed),
            file_reads: self.inner.file_reads.load(Ordering::Relaxed),
            bytes_served: self.inner.bytes_served.load(Ordering::Relaxed),
            overrides_set: self.inner.overrides_set.load(Ordering::Relaxed),
            overrides_dropped: self.inner.overrides_dropped.load(Ordering::Relaxed),
            delta_saves: self.inner.delta_saves.load(Ordering::Relaxed),
            databases_loaded: self.inner.databases_loaded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub lookups: u64,
    pub lookup_misses: u64,
    pub heap_hits: u64,
    pub file_reads: u64,
    pub bytes_served: u64,
    pub overrides_set: u64,
    pub overrides_dropped: u64,
    pub delta_saves: u64,
    pub databases_loaded: u64,
}

impl MetricsSnapshot {
    /// Fraction of served parameters that came from runtime overrides
    pub fn heap_hit_ratio(&self) -> f64 {
        let served = self.heap_hits + self.file_reads;
        if served == 0 {
            0.0
        } else {
            self.heap_hits as f64 / served as f64
        }
    }
}
