//! Strategy Executor
//!
//! Runs a strategy against one named cache and the network fetcher.
//! Stale-while-revalidate refreshes are spawned onto a task tracker owned by
//! the executor so shutdown can wait for or cancel them.
//!
//! A miss in the classified cache falls through to the prefetch cache; a
//! prefetched entry found there is moved into the classified cache.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn};

use super::{Outcome, ServeSource, Strategy};
use crate::cache::{CacheEntry, CacheKey, CacheKind, CacheMetrics, CacheRegistry, NamedCache};
use crate::error::Error;
use crate::fetcher::NetworkFetcher;
use crate::request::{Method, RequestDescriptor, ResponseDescriptor, ServedFrom};

/// Served when no offline page was ever captured
const BUILTIN_OFFLINE_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\">\
<title>Offline</title></head><body><h1>You are offline</h1>\
<p>This page is not available without a network connection.</p></body></html>";

/// Executes caching strategies
pub struct StrategyExecutor {
    registry: Arc<CacheRegistry>,
    fetcher: Arc<dyn NetworkFetcher>,
    metrics: Arc<CacheMetrics>,
    offline_key: CacheKey,
    offline_page: RwLock<Option<CacheEntry>>,
    revalidating: Arc<DashMap<CacheKey, ()>>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl StrategyExecutor {
    pub fn new(
        registry: Arc<CacheRegistry>,
        fetcher: Arc<dyn NetworkFetcher>,
        metrics: Arc<CacheMetrics>,
        offline_key: CacheKey,
    ) -> Self {
        Self {
            registry,
            fetcher,
            metrics,
            offline_key,
            offline_page: RwLock::new(None),
            revalidating: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Run `strategy` for `request` against the cache of `kind`
    #[instrument(skip_all, fields(url = %request.url, cache = %kind, strategy = %strategy))]
    pub async fn execute(
        &self,
        request: &RequestDescriptor,
        kind: CacheKind,
        strategy: Strategy,
    ) -> Outcome {
        let cache = self.registry.open(kind);
        let outcome = match strategy {
            Strategy::CacheFirstWithTtl => self.cache_first(&cache, request).await,
            Strategy::NetworkFirstWithCacheFallback => {
                self.network_first(&cache, request, false).await
            }
            Strategy::NetworkFirstWithOfflineFallback => {
                self.network_first(&cache, request, true).await
            }
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(&cache, request).await,
        };
        self.record(&outcome);
        outcome
    }

    async fn cache_first(&self, cache: &Arc<NamedCache>, request: &RequestDescriptor) -> Outcome {
        let key = request.cache_key();
        let cached = self.lookup(cache, &key);

        if let Some(entry) = &cached {
            if entry.is_fresh(cache.policy().ttl, Utc::now()) {
                self.metrics.record_hit();
                return Outcome::served(entry.to_response(ServedFrom::Cache), ServeSource::FreshCache);
            }
        }
        self.metrics.record_miss();

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(cache, request, &response);
                Outcome::served(response, ServeSource::Network)
            }
            Err(e) => {
                self.metrics.record_network_error();
                match cached {
                    Some(entry) => {
                        debug!(key = %key, error = %e, "Network failed; serving expired entry");
                        Outcome::served(entry.to_response(ServedFrom::Cache), ServeSource::StaleCache)
                    }
                    None => not_found(&key, e),
                }
            }
        }
    }

    async fn network_first(
        &self,
        cache: &Arc<NamedCache>,
        request: &RequestDescriptor,
        offline_fallback: bool,
    ) -> Outcome {
        let e = match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(cache, request, &response);
                return Outcome::served(response, ServeSource::Network);
            }
            Err(e) => e,
        };
        self.metrics.record_network_error();

        let key = request.cache_key();
        if let Some(entry) = self.lookup(cache, &key) {
            debug!(key = %key, error = %e, "Network failed; serving cached entry");
            return Outcome::served(entry.to_response(ServedFrom::Cache), ServeSource::StaleCache);
        }

        if offline_fallback && request.is_navigation() {
            debug!(key = %key, error = %e, "Network failed; serving offline page");
            return Outcome::served(self.offline_response(), ServeSource::Offline);
        }

        not_found(&key, e)
    }

    async fn stale_while_revalidate(
        &self,
        cache: &Arc<NamedCache>,
        request: &RequestDescriptor,
    ) -> Outcome {
        let key = request.cache_key();

        if let Some(entry) = self.lookup(cache, &key) {
            self.metrics.record_hit();
            self.spawn_revalidation(cache.clone(), request.clone());
            return Outcome::served(entry.to_response(ServedFrom::Cache), ServeSource::Revalidating);
        }
        self.metrics.record_miss();

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store(cache, request, &response);
                Outcome::served(response, ServeSource::Network)
            }
            Err(e) => {
                self.metrics.record_network_error();
                not_found(&key, e)
            }
        }
    }

    /// Entry for `key` from `cache`, or a prefetched copy promoted into it
    fn lookup(&self, cache: &NamedCache, key: &CacheKey) -> Option<CacheEntry> {
        if let Some(entry) = cache.get(key) {
            return Some(entry);
        }

        let prefetch = self.registry.open(CacheKind::Prefetch);
        if prefetch.name() == cache.name() {
            return None;
        }
        let entry = prefetch.get(key)?;
        self.metrics.record_prefetch_hit();

        // Keeps its original timestamp, so freshness is judged by the target TTL
        if cache.put_best_effort(entry.clone(), &self.metrics) {
            prefetch.remove(key);
            debug!(key = %key, cache = %cache.name(), "Promoted prefetched entry");
        }
        Some(entry)
    }

    /// Refresh an entry in the background; at most one refresh per key
    fn spawn_revalidation(&self, cache: Arc<NamedCache>, request: RequestDescriptor) {
        let key = request.cache_key();
        if self.revalidating.insert(key.clone(), ()).is_some() {
            debug!(key = %key, "Refresh already in flight");
            return;
        }

        let fetcher = self.fetcher.clone();
        let metrics = self.metrics.clone();
        let revalidating = self.revalidating.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(key = %key, "Refresh cancelled");
                }
                result = fetcher.fetch(&request) => {
                    match result {
                        Ok(response) if is_cacheable(&request, &response) => {
                            let entry = CacheEntry::from_response(key.clone(), &response);
                            cache.put_best_effort(entry, &metrics);
                            metrics.record_revalidation(true);
                            debug!(key = %key, "Refreshed entry");
                        }
                        Ok(response) => {
                            metrics.record_revalidation(false);
                            debug!(key = %key, status = response.status, "Refresh returned non-cacheable response");
                        }
                        Err(e) => {
                            metrics.record_revalidation(false);
                            warn!(key = %key, error = %e, "Background refresh failed");
                        }
                    }
                }
            }
            revalidating.remove(&key);
        });
    }

    fn store(&self, cache: &NamedCache, request: &RequestDescriptor, response: &ResponseDescriptor) {
        if is_cacheable(request, response) {
            let entry = CacheEntry::from_response(request.cache_key(), response);
            cache.put_best_effort(entry, &self.metrics);
        }
    }

    fn record(&self, outcome: &Outcome) {
        match outcome.source() {
            Some(ServeSource::Network) => self.metrics.record_network_served(),
            Some(ServeSource::StaleCache) => self.metrics.record_stale_served(),
            Some(ServeSource::Offline) => self.metrics.record_offline_served(),
            Some(ServeSource::FreshCache) | Some(ServeSource::Revalidating) => {}
            None => self.metrics.record_failure(),
        }
    }

    // =========================================================================
    // Offline Page
    // =========================================================================

    /// Key of the reserved offline page
    pub fn offline_key(&self) -> &CacheKey {
        &self.offline_key
    }

    /// Reserve the entry served to failed navigations
    pub fn set_offline_page(&self, entry: CacheEntry) {
        *self.offline_page.write() = Some(entry);
    }

    pub fn has_offline_page(&self) -> bool {
        self.offline_page.read().is_some()
    }

    fn offline_response(&self) -> ResponseDescriptor {
        if let Some(entry) = self.offline_page.read().as_ref() {
            return entry.to_response(ServedFrom::Offline);
        }
        let html = self.registry.open(CacheKind::Html);
        if let Some(entry) = html.get(&self.offline_key) {
            return entry.to_response(ServedFrom::Offline);
        }
        ResponseDescriptor::new(503, Bytes::from_static(BUILTIN_OFFLINE_PAGE.as_bytes()))
            .with_header("content-type", "text/html; charset=utf-8")
            .served_from(ServedFrom::Offline)
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    /// Background refreshes still running
    pub fn outstanding(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until every background refresh spawned so far has finished
    pub async fn settle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop accepting refreshes; cancel or drain the outstanding ones
    pub async fn shutdown(&self, cancel: bool) {
        if cancel {
            self.cancel.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Neither the network nor the cache had an answer
fn not_found(key: &CacheKey, cause: Error) -> Outcome {
    Outcome::Failed(Error::NotFound {
        key: key.to_string(),
        cause: cause.to_string(),
    })
}

/// Only successful GET responses are stored
fn is_cacheable(request: &RequestDescriptor, response: &ResponseDescriptor) -> bool {
    request.method == Method::Get && response.is_ok()
}

// =============================================================================
// Tests
// =============================================================================
