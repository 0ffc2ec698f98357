//! Lifecycle Controller
//!
//! The [`Engine`] is the facade a host harness drives:
//!
//! ```text
//! restore() ──▶ on_install() ──▶ on_activate() ──▶ handle(request)*
//!                                     │
//!                                     ├─ delete stale same-namespace caches
//!                                     ├─ TTL + size sweep every cache
//!                                     └─ start maintenance loop
//!
//! shutdown() ──▶ stop loop ──▶ drain/cancel background tasks ──▶ save caches
//! ```
//!
//! Requests are refused until activation has finished.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::cache::{
    CacheEntry, CacheKey, CacheKind, CacheMetrics, CacheRegistry, CacheStats, DurableStorage,
    MetricsSnapshot,
};
use crate::classifier::{Classification, RequestClassifier};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::eviction::{EvictionManager, SweepReport};
use crate::fetcher::{HttpFetcher, NetworkFetcher};
use crate::prefetch::{PrefetchQueue, PrefetchSummary};
use crate::request::{RequestDescriptor, ResponseDescriptor};
use crate::strategy::{Outcome, StrategyExecutor};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "version", rename_all = "lowercase")]
pub enum LifecycleState {
    Installing,
    Installed,
    Activating(String),
    Active(String),
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Installing => write!(f, "installing"),
            LifecycleState::Installed => write!(f, "installed"),
            LifecycleState::Activating(v) => write!(f, "activating({})", v),
            LifecycleState::Active(v) => write!(f, "active({})", v),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of the install step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub requested: usize,
    pub cached: usize,
    pub failed: usize,
    /// Whether the offline page came from the origin rather than the built-in
    pub offline_page: bool,
}

/// Result of the activate step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationReport {
    pub version: String,
    pub deleted: Vec<String>,
    pub sweeps: Vec<SweepReport>,
}

/// Point-in-time view of the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub state: LifecycleState,
    pub caches: Vec<CacheStats>,
    pub metrics: MetricsSnapshot,
    pub outstanding_refreshes: usize,
    pub outstanding_prefetches: usize,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Engine`]
pub struct EngineBuilder {
    config: EngineConfig,
    fetcher: Option<Arc<dyn NetworkFetcher>>,
    storage: Option<Arc<dyn DurableStorage>>,
}

impl EngineBuilder {
    /// Use a specific network fetcher instead of the HTTP client
    pub fn fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Persist caches across restarts
    pub fn storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.config.fetch_timeout)?),
        };
        let offline_key = CacheKey::for_url(&self.config.offline_page_url()?);

        let config = Arc::new(self.config);
        let registry = Arc::new(CacheRegistry::new(config.clone()));
        let metrics = Arc::new(CacheMetrics::new());

        Ok(Engine {
            classifier: RequestClassifier::new(&config),
            executor: StrategyExecutor::new(
                registry.clone(),
                fetcher.clone(),
                metrics.clone(),
                offline_key,
            ),
            eviction: Arc::new(EvictionManager::new(registry.clone(), metrics.clone(), &config)),
            prefetch: PrefetchQueue::new(registry.clone(), fetcher.clone(), metrics.clone()),
            state: RwLock::new(LifecycleState::Installing),
            maintenance: Mutex::new(None),
            shutdown: CancellationToken::new(),
            storage: self.storage,
            config,
            registry,
            metrics,
            fetcher,
        })
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Multi-tier response cache and offline delivery engine
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<CacheRegistry>,
    metrics: Arc<CacheMetrics>,
    fetcher: Arc<dyn NetworkFetcher>,
    storage: Option<Arc<dyn DurableStorage>>,
    classifier: RequestClassifier,
    executor: StrategyExecutor,
    eviction: Arc<EvictionManager>,
    prefetch: PrefetchQueue,
    state: RwLock<LifecycleState>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            fetcher: None,
            storage: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> LifecycleState {
        self.state.read().clone()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state.read(), LifecycleState::Active(_))
    }

    fn set_state(&self, state: LifecycleState) {
        info!(state = %state, "Lifecycle transition");
        *self.state.write() = state;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load persisted caches of this namespace, including other versions.
    /// Returns the number of entries restored.
    pub async fn restore(&self) -> Result<usize> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(0),
        };

        let prefix = self.config.namespace_prefix();
        let mut restored = 0;
        for name in storage.list().await? {
            if !name.starts_with(&prefix) {
                continue;
            }
            match storage.load(&name).await {
                Ok(entries) => {
                    let count = self.registry.open_named(&name).restore(entries);
                    debug!(cache = %name, entries = count, "Restored cache");
                    restored += count;
                }
                Err(e) => warn!(cache = %name, error = %e, "Failed to restore cache"),
            }
        }
        info!(entries = restored, caches = self.registry.len(), "Restore complete");
        Ok(restored)
    }

    /// Best-effort pre-population of the static and html caches plus the
    /// reserved offline page. Never fails on individual fetches.
    #[instrument(skip(self))]
    pub async fn on_install(&self) -> InstallReport {
        // An active engine refreshes its precache in place and keeps serving
        let refresh = self.is_active();
        if !refresh {
            self.set_state(LifecycleState::Installing);
        }

        let mut targets = Vec::new();
        for path in &self.config.precache.static_assets {
            targets.push((CacheKind::Static, path.as_str(), false));
        }
        for path in &self.config.precache.pages {
            targets.push((CacheKind::Html, path.as_str(), true));
        }
        targets.push((CacheKind::Html, self.config.offline_page.as_str(), true));

        let mut report = InstallReport {
            requested: targets.len(),
            ..Default::default()
        };

        let fetches = targets
            .into_iter()
            .map(|(kind, path, page)| self.precache_one(kind, path, page));
        for entry in join_all(fetches).await {
            match entry {
                Some(entry) => {
                    report.cached += 1;
                    if entry.key() == self.executor.offline_key() {
                        self.executor.set_offline_page(entry);
                        report.offline_page = true;
                    }
                }
                None => report.failed += 1,
            }
        }

        if !report.offline_page {
            warn!(page = %self.config.offline_page, "Offline page unavailable; using built-in page");
        }
        info!(cached = report.cached, failed = report.failed, refresh, "Install complete");
        if !refresh {
            self.set_state(LifecycleState::Installed);
        }
        report
    }

    async fn precache_one(&self, kind: CacheKind, path: &str, page: bool) -> Option<CacheEntry> {
        let url = match self.config.resolve(path) {
            Ok(url) => url,
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping precache asset");
                return None;
            }
        };
        let url_str = url.to_string();
        let request = if page {
            RequestDescriptor::navigate(&url_str).ok()?
        } else {
            RequestDescriptor::get(&url_str).ok()?
        };

        match self.fetcher.fetch(&request).await {
            Ok(response) if response.is_ok() => {
                let entry = CacheEntry::from_response(request.cache_key(), &response);
                if self
                    .registry
                    .open(kind)
                    .put_best_effort(entry.clone(), &self.metrics)
                {
                    Some(entry)
                } else {
                    None
                }
            }
            Ok(response) => {
                warn!(url = %url, status = response.status, "Precache fetch returned non-200");
                None
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Precache fetch failed");
                None
            }
        }
    }

    /// Remove stale caches, sweep, then start serving
    #[instrument(skip(self))]
    pub async fn on_activate(&self) -> Result<ActivationReport> {
        if self.state() == LifecycleState::Stopped {
            return Err(Error::NotActive {
                state: LifecycleState::Stopped.to_string(),
            });
        }
        let version = self.config.version.clone();
        self.set_state(LifecycleState::Activating(version.clone()));

        let mut deleted = Vec::new();
        for name in self.registry.stale_names() {
            if self.registry.delete(&name) {
                deleted.push(name);
            }
        }
        if let Some(storage) = &self.storage {
            for name in self.stale_persisted(storage.as_ref()).await {
                match storage.remove(&name).await {
                    Ok(_) if !deleted.contains(&name) => deleted.push(name),
                    Ok(_) => {}
                    Err(e) => warn!(cache = %name, error = %e, "Failed to remove stale cache"),
                }
            }
        }
        deleted.sort();

        let sweeps = self.eviction.sweep_all().await;
        self.set_state(LifecycleState::Active(version.clone()));
        self.start_maintenance();

        info!(version = %version, deleted = deleted.len(), "Activation complete");
        Ok(ActivationReport {
            version,
            deleted,
            sweeps,
        })
    }

    async fn stale_persisted(&self, storage: &dyn DurableStorage) -> Vec<String> {
        let prefix = self.config.namespace_prefix();
        let current = self.registry.current_names();
        match storage.list().await {
            Ok(names) => names
                .into_iter()
                .filter(|name| name.starts_with(&prefix) && !current.contains(name))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list persisted caches");
                Vec::new()
            }
        }
    }

    fn start_maintenance(&self) {
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }
        let eviction = self.eviction.clone();
        let shutdown = self.shutdown.child_token();
        *maintenance = Some(tokio::spawn(eviction.run(shutdown)));
    }

    // =========================================================================
    // Request Path
    // =========================================================================

    /// Serve one request.
    ///
    /// API requests that can be served neither from the network nor from
    /// cache get a structured 503 payload instead of an error.
    pub async fn handle(&self, request: &RequestDescriptor) -> Result<ResponseDescriptor> {
        if !self.is_active() {
            return Err(Error::NotActive {
                state: self.state().to_string(),
            });
        }

        match self.classifier.classify(request) {
            Classification::Bypass => {
                self.metrics.record_bypass();
                debug!(url = %request.url, "Bypassing cache");
                self.fetcher.fetch(request).await
            }
            Classification::Cached { cache, strategy } => {
                match self.executor.execute(request, cache, strategy).await {
                    Outcome::Served { response, .. } => Ok(response),
                    Outcome::Failed(e) if cache == CacheKind::Api => {
                        debug!(url = %request.url, error = %e, "Serving offline API payload");
                        Ok(ResponseDescriptor::offline_api_error(&e.to_string()))
                    }
                    Outcome::Failed(e) => Err(e),
                }
            }
        }
    }

    /// Classification of a request without serving it
    pub fn classify(&self, request: &RequestDescriptor) -> Classification {
        self.classifier.classify(request)
    }

    // =========================================================================
    // Control Channel
    // =========================================================================

    /// Run one TTL + size sweep over every cache now
    pub async fn trigger_maintenance(&self) -> Vec<SweepReport> {
        self.eviction.sweep_all().await
    }

    /// Queue URLs for background prefetching
    pub fn prefetch<I, S>(&self, urls: I) -> JoinHandle<PrefetchSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.prefetch.enqueue(urls)
    }

    /// Drop one cache, addressed by kind (`audio`) or full name.
    /// Returns whether anything was removed.
    pub async fn purge_cache(&self, name: &str) -> Result<bool> {
        let full = match name.parse::<CacheKind>() {
            Ok(kind) => self.registry.cache_name(kind),
            Err(_) => name.to_string(),
        };

        let mut removed = self.registry.delete(&full);
        if let Some(storage) = &self.storage {
            removed |= storage.remove(&full).await?;
        }
        if !removed {
            debug!(cache = %full, "Purge found nothing to remove");
        }
        Ok(removed)
    }

    /// Per-cache statistics and counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state(),
            caches: self.registry.stats(),
            metrics: self.metrics.snapshot(),
            outstanding_refreshes: self.executor.outstanding(),
            outstanding_prefetches: self.prefetch.in_flight(),
        }
    }

    /// Wait for background refreshes spawned so far
    pub async fn settle(&self) {
        self.executor.settle().await;
    }

    /// Absolute URL of the reserved offline page
    pub fn offline_page_url(&self) -> Result<Url> {
        self.config.offline_page_url()
    }

    /// Stop maintenance, drain (or cancel) background work and persist every
    /// cache. Returns the number of caches saved.
    pub async fn shutdown(&self, cancel_background: bool) -> Result<usize> {
        self.set_state(LifecycleState::Stopped);
        self.shutdown.cancel();

        let maintenance = self.maintenance.lock().take();
        if let Some(handle) = maintenance {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }

        self.executor.shutdown(cancel_background).await;
        self.prefetch.shutdown(cancel_background).await;

        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(0),
        };

        let mut saved = 0;
        for cache in self.registry.caches() {
            match storage.save(cache.name(), &cache.entries()).await {
                Ok(()) => saved += 1,
                Err(e) => warn!(cache = %cache.name(), error = %e, "Failed to save cache"),
            }
        }
        info!(caches = saved, "Shutdown complete");
        Ok(saved)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStorage;
    use crate::fetcher::ScriptedFetcher;
    use crate::request::ServedFrom;
    use assert_matches::assert_matches;

    const ORIGIN: &str = "https://app.example.com";

    fn config(version: &str) -> EngineConfig {
        EngineConfig {
            origin: ORIGIN.to_string(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    fn engine(version: &str, fetcher: Arc<ScriptedFetcher>) -> Engine {
        Engine::builder(config(version)).fetcher(fetcher).build().unwrap()
    }

    fn url(path: &str) -> String {
        format!("{}{}", ORIGIN, path)
    }

    #[tokio::test]
    async fn test_requests_refused_before_activation() {
        let engine = engine("v1", Arc::new(ScriptedFetcher::new()));
        let req = RequestDescriptor::get(&url("/data.bin")).unwrap();
        assert_matches!(engine.handle(&req).await, Err(Error::NotActive { .. }));

        engine.on_install().await;
        assert_matches!(engine.handle(&req).await, Err(Error::NotActive { .. }));

        engine.on_activate().await.unwrap();
        assert!(engine.handle(&req).await.is_ok());
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_install_precaches_and_tolerates_failures() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(&url("/"), 200, "<html>home</html>");
        fetcher.respond(&url("/offline.html"), 200, "<html>offline</html>");
        fetcher.fail(&url("/manifest.json"), "unreachable");

        let engine = engine("v1", fetcher);
        let report = engine.on_install().await;
        assert_eq!(report.requested, 3);
        assert_eq!(report.cached, 2);
        assert_eq!(report.failed, 1);
        assert!(report.offline_page);
        assert_eq!(engine.state(), LifecycleState::Installed);
        assert_eq!(engine.registry().open(CacheKind::Html).len(), 2);
    }

    #[tokio::test]
    async fn test_reinstall_while_active_keeps_serving() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(&url("/"), 200, "<html>home</html>");
        fetcher.respond(&url("/offline.html"), 200, "<html>offline</html>");
        let engine = engine("v1", fetcher.clone());
        engine.on_install().await;
        engine.on_activate().await.unwrap();

        fetcher.respond(&url("/"), 200, "<html>home v2</html>");
        let report = engine.on_install().await;
        assert_eq!(report.cached, 2);
        assert_eq!(engine.state(), LifecycleState::Active("v1".to_string()));

        let req = RequestDescriptor::get(&url("/data.bin")).unwrap();
        fetcher.respond(&url("/data.bin"), 200, "bin");
        assert!(engine.handle(&req).await.is_ok());
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_activation_removes_only_stale_same_namespace_caches() {
        let engine = engine("v2", Arc::new(ScriptedFetcher::new()));
        engine.registry().open_named("edgecache-audio-v1");
        engine.registry().open_named("edgecache-html-v1");
        engine.registry().open_named("othertool-audio-v1");
        engine.registry().open(CacheKind::Audio);

        let report = engine.on_activate().await.unwrap();
        assert_eq!(report.version, "v2");
        assert_eq!(report.deleted, vec!["edgecache-audio-v1", "edgecache-html-v1"]);

        let names = engine.registry().names();
        assert!(names.contains(&"othertool-audio-v1".to_string()));
        assert!(names.contains(&"edgecache-audio-v2".to_string()));
        assert_eq!(engine.state(), LifecycleState::Active("v2".to_string()));
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_api_failure_returns_structured_payload() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let engine = engine("v1", fetcher.clone());
        engine.on_activate().await.unwrap();
        fetcher.set_offline(true);

        let req = RequestDescriptor::get(&url("/api/tracks")).unwrap();
        let response = engine.handle(&req).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.served_from, ServedFrom::Offline);
        assert_eq!(response.headers.get("content-type").map(String::as_str), Some("application/json"));

        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "Offline");
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_api_failure_is_not_found() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let engine = engine("v1", fetcher.clone());
        engine.on_activate().await.unwrap();
        fetcher.set_offline(true);

        let req = RequestDescriptor::get(&url("/data.bin")).unwrap();
        let err = engine.handle(&req).await.unwrap_err();
        assert!(err.is_not_found());
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_bypass_goes_straight_to_network() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(&url("/live"), 101, "");
        let engine = engine("v1", fetcher.clone());
        engine.on_activate().await.unwrap();

        let req = RequestDescriptor::get(&url("/live")).unwrap().with_header("upgrade", "websocket");
        let response = engine.handle(&req).await.unwrap();
        assert_eq!(response.status, 101);
        assert_eq!(engine.stats().metrics.bypassed, 1);
        assert!(engine.registry().caches().iter().all(|c| c.is_empty()));
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_by_kind_and_name() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(&url("/api/a"), 200, "[]");
        let engine = engine("v1", fetcher);
        engine.on_activate().await.unwrap();
        engine.handle(&RequestDescriptor::get(&url("/api/a")).unwrap()).await.unwrap();

        assert!(engine.purge_cache("api").await.unwrap());
        assert!(!engine.purge_cache("edgecache-api-v1").await.unwrap());
        assert!(engine.registry().get("edgecache-api-v1").is_none());
        engine.shutdown(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_persists_and_restore_reloads() {
        let storage = Arc::new(InMemoryStorage::new());
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.respond(&url("/api/a"), 200, "[1]");

        let first = Engine::builder(config("v1"))
            .fetcher(fetcher.clone())
            .storage(storage.clone())
            .build()
            .unwrap();
        first.on_activate().await.unwrap();
        first.handle(&RequestDescriptor::get(&url("/api/a")).unwrap()).await.unwrap();
        let saved = first.shutdown(false).await.unwrap();
        assert!(saved >= 1);
        assert_eq!(first.state(), LifecycleState::Stopped);

        let second = Engine::builder(config("v1"))
            .fetcher(fetcher)
            .storage(storage)
            .build()
            .unwrap();
        assert_eq!(second.restore().await.unwrap(), 1);
        let api = second.registry().open(CacheKind::Api);
        assert_eq!(api.len(), 1);
    }
}
