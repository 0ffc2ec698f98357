//! Cache Metrics Collection
//!
//! Lock-free counters for request outcomes, eviction and background work.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-wide metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Request outcomes
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_served: AtomicU64,
    stale_served: AtomicU64,
    offline_served: AtomicU64,
    failures: AtomicU64,
    bypassed: AtomicU64,

    // Collaborator failures
    network_errors: AtomicU64,
    storage_write_errors: AtomicU64,

    // Eviction
    ttl_evictions: AtomicU64,
    size_evictions: AtomicU64,
    bytes_evicted: AtomicU64,
    sweeps: AtomicU64,

    // Background work
    revalidations: AtomicU64,
    revalidation_failures: AtomicU64,
    prefetch_issued: AtomicU64,
    prefetch_skipped: AtomicU64,
    prefetch_failed: AtomicU64,
    prefetch_hits: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_served(&self) {
        self.network_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_offline_served(&self) {
        self.offline_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_network_error(&self) {
        self.network_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_write_error(&self) {
        self.storage_write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ttl_evictions(&self, count: u64, bytes: u64) {
        self.ttl_evictions.fetch_add(count, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_size_evictions(&self, count: u64, bytes: u64) {
        self.size_evictions.fetch_add(count, Ordering::Relaxed);
        self.bytes_evicted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revalidation(&self, ok: bool) {
        self.revalidations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.revalidation_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_prefetch_issued(&self) {
        self.prefetch_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_skipped(&self) {
        self.prefetch_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prefetch_failed(&self) {
        self.prefetch_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A request was answered from a prefetched entry
    pub fn record_prefetch_hit(&self) {
        self.prefetch_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.cache_misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            network_served: self.network_served.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            offline_served: self.offline_served.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            storage_write_errors: self.storage_write_errors.load(Ordering::Relaxed),
            ttl_evictions: self.ttl_evictions.load(Ordering::Relaxed),
            size_evictions: self.size_evictions.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            revalidation_failures: self.revalidation_failures.load(Ordering::Relaxed),
            prefetch_issued: self.prefetch_issued.load(Ordering::Relaxed),
            prefetch_skipped: self.prefetch_skipped.load(Ordering::Relaxed),
            prefetch_failed: self.prefetch_failed.load(Ordering::Relaxed),
            prefetch_hits: self.prefetch_hits.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot for reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f64,
    pub network_served: u64,
    pub stale_served: u64,
    pub offline_served: u64,
    pub failures: u64,
    pub bypassed: u64,
    pub network_errors: u64,
    pub storage_write_errors: u64,
    pub ttl_evictions: u64,
    pub size_evictions: u64,
    pub bytes_evicted: u64,
    pub sweeps: u64,
    pub revalidations: u64,
    pub revalidation_failures: u64,
    pub prefetch_issued: u64,
    pub prefetch_skipped: u64,
    pub prefetch_failed: u64,
    pub prefetch_hits: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);

        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert!((metrics.hit_ratio() - 0.75).abs() < 0.001);
    }

    #[test]
    fn test_eviction_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_ttl_evictions(2, 300);
        metrics.record_size_evictions(1, 200);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.ttl_evictions, 2);
        assert_eq!(snapshot.size_evictions, 1);
        assert_eq!(snapshot.bytes_evicted, 500);
    }

    #[test]
    fn test_revalidation_failures_counted() {
        let metrics = CacheMetrics::new();
        metrics.record_revalidation(true);
        metrics.record_revalidation(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.revalidations, 2);
        assert_eq!(snapshot.revalidation_failures, 1);
    }
}
