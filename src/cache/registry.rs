//! Cache Registry
//!
//! Owns every named cache of the process. Caches are created lazily and
//! idempotently on first access; the set of names is effectively append-only
//! apart from version cutover and explicit purges.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::named::{CacheStats, NamedCache};
use super::CacheKind;
use crate::config::{CachePolicy, EngineConfig};

/// Registry of named caches
#[derive(Debug)]
pub struct CacheRegistry {
    config: Arc<EngineConfig>,
    caches: DashMap<String, Arc<NamedCache>>,
}

impl CacheRegistry {
    /// Create an empty registry
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Self {
            config,
            caches: DashMap::new(),
        }
    }

    /// Full, versioned name of a cache kind
    pub fn cache_name(&self, kind: CacheKind) -> String {
        self.config.cache_name(kind)
    }

    /// Open (creating if needed) the cache for a kind
    pub fn open(&self, kind: CacheKind) -> Arc<NamedCache> {
        self.open_named(&self.cache_name(kind))
    }

    /// Open (creating if needed) a cache by full name.
    ///
    /// Names that follow the current `{namespace}-{kind}-{version}` pattern
    /// get that kind's policy; anything else gets the default policy.
    pub fn open_named(&self, name: &str) -> Arc<NamedCache> {
        if let Some(cache) = self.caches.get(name) {
            return cache.clone();
        }

        // entry() holds the shard write lock, so concurrent first access
        // creates exactly one cache
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| {
                let policy = self.policy_for_name(name);
                debug!(cache = %name, ttl_secs = policy.ttl.as_secs(), max_bytes = policy.max_bytes, "Created cache");
                Arc::new(NamedCache::new(name, policy))
            })
            .clone()
    }

    /// Look up an existing cache without creating it
    pub fn get(&self, name: &str) -> Option<Arc<NamedCache>> {
        self.caches.get(name).map(|cache| cache.clone())
    }

    /// Drop a cache entirely
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.caches.remove(name).is_some();
        if removed {
            info!(cache = %name, "Deleted cache");
        }
        removed
    }

    /// Names of every cache currently held, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    /// Every cache currently held, sorted by name
    pub fn caches(&self) -> Vec<Arc<NamedCache>> {
        let mut caches: Vec<Arc<NamedCache>> = self.caches.iter().map(|c| c.value().clone()).collect();
        caches.sort_by(|a, b| a.name().cmp(b.name()));
        caches
    }

    /// Cache names the current version owns
    pub fn current_names(&self) -> Vec<String> {
        CacheKind::ALL
            .iter()
            .map(|kind| self.cache_name(*kind))
            .collect()
    }

    /// Caches the current version owns that exist so far, sorted by name.
    /// Foreign and stale caches are never part of this set.
    pub fn owned_caches(&self) -> Vec<Arc<NamedCache>> {
        let current = self.current_names();
        self.caches()
            .into_iter()
            .filter(|cache| current.iter().any(|name| name == cache.name()))
            .collect()
    }

    /// Caches in this namespace that the current version does not own
    pub fn stale_names(&self) -> Vec<String> {
        let prefix = self.config.namespace_prefix();
        let current = self.current_names();
        self.names()
            .into_iter()
            .filter(|name| name.starts_with(&prefix) && !current.contains(name))
            .collect()
    }

    pub fn stats(&self) -> Vec<CacheStats> {
        self.caches().iter().map(|cache| cache.stats()).collect()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    fn policy_for_name(&self, name: &str) -> CachePolicy {
        let kind = name
            .strip_prefix(&self.config.namespace_prefix())
            .and_then(|rest| rest.strip_suffix(&format!("-{}", self.config.version)))
            .and_then(|kind| kind.parse::<CacheKind>().ok())
            .unwrap_or(CacheKind::Default);
        self.config.policy_for(kind)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> CacheRegistry {
        let mut config = EngineConfig::default();
        config
            .caches
            .insert(CacheKind::Api, CachePolicy::new(Duration::from_secs(60), 1024));
        CacheRegistry::new(Arc::new(config))
    }

    #[test]
    fn test_open_is_idempotent() {
        let registry = registry();
        let a = registry.open(CacheKind::Audio);
        let b = registry.open(CacheKind::Audio);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(a.name(), "edgecache-audio-v1");
    }

    #[test]
    fn test_policy_follows_kind() {
        let registry = registry();
        let api = registry.open(CacheKind::Api);
        assert_eq!(api.policy(), CachePolicy::new(Duration::from_secs(60), 1024));

        let foreign = registry.open_named("edgecache-api-v0");
        assert_eq!(foreign.policy(), CachePolicy::default_for(CacheKind::Default));
    }

    #[test]
    fn test_stale_names_stay_in_namespace() {
        let registry = registry();
        registry.open(CacheKind::Html);
        registry.open_named("edgecache-html-v0");
        registry.open_named("someone-else-v0");

        assert_eq!(registry.stale_names(), vec!["edgecache-html-v0".to_string()]);
    }

    #[test]
    fn test_owned_caches_exclude_foreign_and_stale() {
        let registry = registry();
        registry.open(CacheKind::Audio);
        registry.open(CacheKind::Api);
        registry.open_named("edgecache-audio-v0");
        registry.open_named("othertool-audio-v1");

        let owned: Vec<String> = registry
            .owned_caches()
            .iter()
            .map(|cache| cache.name().to_string())
            .collect();
        assert_eq!(owned, vec!["edgecache-api-v1", "edgecache-audio-v1"]);
    }

    #[test]
    fn test_concurrent_first_access_creates_one_cache() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.open(CacheKind::Static))
            })
            .collect();

        let caches: Vec<Arc<NamedCache>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(caches.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_delete() {
        let registry = registry();
        registry.open(CacheKind::Api);
        assert!(registry.delete("edgecache-api-v1"));
        assert!(!registry.delete("edgecache-api-v1"));
        assert!(registry.is_empty());
    }
}
