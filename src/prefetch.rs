//! Prefetch Queue
//!
//! Warms the prefetch cache with URLs the host expects to need soon.
//! Enqueueing never blocks and never fails: fetches run as tracked background
//! tasks at low priority, successes are stored and every failure is dropped.
//!
//! A URL is fetched at most once while a fetch for it is outstanding, both
//! within one call and across concurrent calls.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheKind, CacheMetrics, CacheRegistry, NamedCache};
use crate::fetcher::NetworkFetcher;
use crate::request::{FetchPriority, Method, RequestDescriptor};

/// What became of one `enqueue` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchSummary {
    pub requested: usize,
    /// Fetches actually issued
    pub issued: usize,
    pub stored: usize,
    /// Duplicates, already cached, already in flight or unparseable
    pub skipped: usize,
    pub failed: usize,
}

/// Background prefetcher
pub struct PrefetchQueue {
    registry: Arc<CacheRegistry>,
    fetcher: Arc<dyn NetworkFetcher>,
    metrics: Arc<CacheMetrics>,
    in_flight: Arc<DashMap<CacheKey, ()>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl PrefetchQueue {
    pub fn new(
        registry: Arc<CacheRegistry>,
        fetcher: Arc<dyn NetworkFetcher>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        Self {
            registry,
            fetcher,
            metrics,
            in_flight: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Queue `urls` for prefetching.
    ///
    /// Deduplication happens before this returns; the fetches themselves run
    /// in the background. Awaiting the handle is optional.
    pub fn enqueue<I, S>(&self, urls: I) -> JoinHandle<PrefetchSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cache = self.registry.open(CacheKind::Prefetch);
        let mut summary = PrefetchSummary::default();
        let mut seen = HashSet::new();
        let mut accepted = Vec::new();

        for raw in urls {
            summary.requested += 1;
            let url = match Url::parse(raw.as_ref()) {
                Ok(url) => url,
                Err(e) => {
                    debug!(url = %raw.as_ref(), error = %e, "Skipping unparseable prefetch url");
                    self.skip(&mut summary);
                    continue;
                }
            };

            let key = CacheKey::new(&Method::Get, &url);
            if !seen.insert(key.clone()) || cache.contains(&key) {
                self.skip(&mut summary);
                continue;
            }
            if self.in_flight.insert(key.clone(), ()).is_some() {
                debug!(key = %key, "Prefetch already in flight");
                self.skip(&mut summary);
                continue;
            }
            accepted.push((key, url));
        }

        summary.issued = accepted.len();
        let fetcher = self.fetcher.clone();
        let metrics = self.metrics.clone();
        let in_flight = self.in_flight.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let fetches = accepted.into_iter().map(|(key, url)| {
                prefetch_one(&cache, fetcher.as_ref(), &metrics, &in_flight, &cancel, key, url)
            });
            for stored in join_all(fetches).await {
                if stored {
                    summary.stored += 1;
                } else {
                    summary.failed += 1;
                }
            }
            if summary.issued > 0 {
                info!(
                    requested = summary.requested,
                    stored = summary.stored,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    "Prefetch batch finished"
                );
            }
            summary
        })
    }

    /// Prefetches currently outstanding
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Stop accepting work; cancel or drain outstanding fetches
    pub async fn shutdown(&self, cancel: bool) {
        if cancel {
            self.cancel.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn skip(&self, summary: &mut PrefetchSummary) {
        summary.skipped += 1;
        self.metrics.record_prefetch_skipped();
    }
}

/// Fetch one URL and store it; returns whether an entry was written
async fn prefetch_one(
    cache: &NamedCache,
    fetcher: &dyn NetworkFetcher,
    metrics: &CacheMetrics,
    in_flight: &DashMap<CacheKey, ()>,
    cancel: &CancellationToken,
    key: CacheKey,
    url: Url,
) -> bool {
    metrics.record_prefetch_issued();
    let request = RequestDescriptor::from_url(Method::Get, url).with_priority(FetchPriority::Low);

    let stored = tokio::select! {
        _ = cancel.cancelled() => false,
        result = fetcher.fetch(&request) => {
            match result {
                Ok(response) if response.is_ok() => {
                    cache.put_best_effort(CacheEntry::from_response(key.clone(), &response), metrics)
                }
                Ok(response) => {
                    debug!(key = %key, status = response.status, "Prefetch returned non-cacheable response");
                    false
                }
                Err(e) => {
                    debug!(key = %key, error = %e, "Prefetch failed");
                    false
                }
            }
        }
    };

    if !stored {
        metrics.record_prefetch_failed();
    }
    in_flight.remove(&key);
    stored
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fetcher::ScriptedFetcher;
    use std::time::Duration;

    const URL1: &str = "https://cdn.example.com/audio/1.mp3";
    const URL2: &str = "https://cdn.example.com/audio/2.mp3";

    fn setup() -> (PrefetchQueue, Arc<ScriptedFetcher>, Arc<CacheRegistry>, Arc<CacheMetrics>) {
        let registry = Arc::new(CacheRegistry::new(Arc::new(EngineConfig::default())));
        let fetcher = Arc::new(ScriptedFetcher::new());
        let metrics = Arc::new(CacheMetrics::new());
        let queue = PrefetchQueue::new(registry.clone(), fetcher.clone(), metrics.clone());
        (queue, fetcher, registry, metrics)
    }

    fn key(url: &str) -> CacheKey {
        CacheKey::for_url(&Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_duplicate_urls_fetched_once() {
        let (queue, fetcher, registry, _) = setup();
        fetcher.respond(URL1, 200, "one");
        fetcher.respond(URL2, 200, "two");

        let summary = queue.enqueue([URL1, URL1, URL2]).await.unwrap();
        assert_eq!(fetcher.calls(URL1), 1);
        assert_eq!(fetcher.calls(URL2), 1);
        assert_eq!(summary.issued, 2);
        assert_eq!(summary.stored, 2);
        assert_eq!(summary.skipped, 1);

        let cache = registry.open(CacheKind::Prefetch);
        assert!(cache.contains(&key(URL1)));
        assert!(cache.contains(&key(URL2)));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_in_flight_fetch() {
        let (queue, fetcher, _, _) = setup();
        fetcher.respond(URL1, 200, "one");
        fetcher.set_latency(Duration::from_millis(50));

        let first = queue.enqueue([URL1]);
        let second = queue.enqueue([URL1]);
        assert_eq!(queue.in_flight(), 1);

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(first.issued + second.issued, 1);
        assert_eq!(fetcher.calls(URL1), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cached_urls_skipped() {
        let (queue, fetcher, _, _) = setup();
        fetcher.respond(URL1, 200, "one");

        queue.enqueue([URL1]).await.unwrap();
        let summary = queue.enqueue([URL1]).await.unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(fetcher.calls(URL1), 1);
    }

    #[tokio::test]
    async fn test_failures_swallowed() {
        let (queue, fetcher, registry, metrics) = setup();
        fetcher.fail(URL1, "connection reset");
        fetcher.respond(URL2, 500, "boom");

        let summary = queue.enqueue([URL1, URL2, "not a url"]).await.unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.skipped, 1);
        assert!(registry.open(CacheKind::Prefetch).is_empty());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prefetch_issued, 2);
        assert_eq!(snapshot.prefetch_failed, 2);
        assert_eq!(snapshot.prefetch_skipped, 1);
    }

    #[tokio::test]
    async fn test_failed_url_can_be_retried_later() {
        let (queue, fetcher, registry, _) = setup();
        fetcher.fail(URL1, "timeout");
        queue.enqueue([URL1]).await.unwrap();

        fetcher.respond(URL1, 200, "one");
        let summary = queue.enqueue([URL1]).await.unwrap();
        assert_eq!(summary.stored, 1);
        assert!(registry.open(CacheKind::Prefetch).contains(&key(URL1)));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_outstanding() {
        let (queue, fetcher, registry, _) = setup();
        fetcher.respond(URL1, 200, "one");
        fetcher.set_latency(Duration::from_secs(30));

        let handle = queue.enqueue([URL1]);
        tokio::time::timeout(Duration::from_secs(1), queue.shutdown(true))
            .await
            .unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.stored, 0);
        assert!(registry.open(CacheKind::Prefetch).is_empty());
    }
}
