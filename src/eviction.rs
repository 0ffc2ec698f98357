//! Eviction Manager
//!
//! Two independent maintenance passes per named cache:
//!
//! - **TTL sweep**: delete every entry that is untimed or whose age has
//!   reached the cache TTL
//! - **Size sweep**: when the cache is over its byte bound, delete the oldest
//!   entries until usage is at or below `max_bytes * hysteresis`
//!
//! Both passes work from a snapshot of entry metadata and delete by
//! `(key, seq)`, so an entry rewritten after the snapshot is skipped rather
//! than resurrected or double-counted. The cache lock is taken once per
//! entry and the pass yields to the scheduler every `batch_size` deletions.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::cache::{CacheMetrics, CacheRegistry, EntryInfo, NamedCache};
use crate::config::EngineConfig;

/// Which pass produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    Ttl,
    Size,
}

/// Result of one pass over one cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cache: String,
    pub kind: SweepKind,
    /// Entries looked at
    pub examined: usize,
    pub removed: usize,
    pub bytes_freed: u64,
    /// Candidates rewritten or removed by someone else mid-pass
    pub skipped: usize,
}

impl SweepReport {
    fn new(cache: &NamedCache, kind: SweepKind) -> Self {
        Self {
            cache: cache.name().to_string(),
            kind,
            examined: 0,
            removed: 0,
            bytes_freed: 0,
            skipped: 0,
        }
    }
}

/// Runs TTL and size sweeps over the registry
pub struct EvictionManager {
    registry: Arc<CacheRegistry>,
    metrics: Arc<CacheMetrics>,
    hysteresis: f64,
    interval: Duration,
    batch_size: usize,
}

impl EvictionManager {
    pub fn new(
        registry: Arc<CacheRegistry>,
        metrics: Arc<CacheMetrics>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            hysteresis: config.hysteresis,
            interval: config.maintenance_interval,
            batch_size: config.sweep_batch_size.max(1),
        }
    }

    /// Interval of the recurring maintenance loop
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Delete expired and untimed entries
    pub async fn ttl_sweep(&self, cache: &NamedCache) -> SweepReport {
        self.ttl_sweep_at(cache, Utc::now()).await
    }

    /// TTL sweep against an explicit clock
    pub async fn ttl_sweep_at(&self, cache: &NamedCache, now: DateTime<Utc>) -> SweepReport {
        let ttl = cache.policy().ttl;
        let infos = cache.entry_infos();
        let mut report = SweepReport::new(cache, SweepKind::Ttl);
        report.examined = infos.len();

        let expired = infos.into_iter().filter(|info| info.is_expired(ttl, now));
        for (i, info) in expired.enumerate() {
            self.delete(cache, &info, &mut report);
            if (i + 1) % self.batch_size == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.metrics
            .record_ttl_evictions(report.removed as u64, report.bytes_freed);
        if report.removed > 0 {
            debug!(cache = %report.cache, removed = report.removed, bytes = report.bytes_freed, "TTL sweep");
        }
        report
    }

    /// Shrink an over-full cache to its hysteresis target, oldest first.
    ///
    /// Untimed entries go first; ties on `stored_at` fall back to write
    /// order.
    pub async fn size_sweep(&self, cache: &NamedCache) -> SweepReport {
        let max_bytes = cache.policy().max_bytes;
        let mut report = SweepReport::new(cache, SweepKind::Size);
        if cache.total_bytes() <= max_bytes {
            return report;
        }

        let target = (max_bytes as f64 * self.hysteresis).floor() as u64;
        let mut infos = cache.entry_infos();
        infos.sort_by(|a, b| a.stored_at.cmp(&b.stored_at).then(a.seq.cmp(&b.seq)));

        for info in infos {
            if cache.total_bytes() <= target {
                break;
            }
            report.examined += 1;
            self.delete(cache, &info, &mut report);
            if report.examined % self.batch_size == 0 {
                tokio::task::yield_now().await;
            }
        }

        self.metrics
            .record_size_evictions(report.removed as u64, report.bytes_freed);
        info!(
            cache = %report.cache,
            removed = report.removed,
            bytes = report.bytes_freed,
            total = cache.total_bytes(),
            target,
            "Size sweep"
        );
        report
    }

    /// TTL then size sweep over one cache
    pub async fn sweep_cache(&self, cache: &NamedCache) -> (SweepReport, SweepReport) {
        let ttl = self.ttl_sweep(cache).await;
        let size = self.size_sweep(cache).await;
        (ttl, size)
    }

    /// One full maintenance pass over the caches of the current version
    #[instrument(skip(self))]
    pub async fn sweep_all(&self) -> Vec<SweepReport> {
        let caches = self.registry.owned_caches();
        let mut reports = Vec::new();
        for cache in &caches {
            let (ttl, size) = self.sweep_cache(cache).await;
            reports.push(ttl);
            reports.push(size);
        }
        self.metrics.record_sweep();

        let removed: usize = reports.iter().map(|r| r.removed).sum();
        let freed: u64 = reports.iter().map(|r| r.bytes_freed).sum();
        info!(caches = caches.len(), removed, bytes_freed = freed, "Maintenance pass complete");
        reports
    }

    /// Recurring maintenance until `shutdown` fires.
    ///
    /// The first pass happens one full interval after start; activation
    /// sweeps on its own.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting maintenance loop");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Maintenance loop shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.sweep_all().await;
                }
            }
        }
    }

    fn delete(&self, cache: &NamedCache, info: &EntryInfo, report: &mut SweepReport) {
        match cache.remove_if_unchanged(&info.key, info.seq) {
            Some(freed) => {
                report.removed += 1;
                report.bytes_freed += freed;
            }
            None => {
                report.skipped += 1;
                debug!(cache = %cache.name(), key = %info.key, "Entry changed during sweep; skipped");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
