//! Named Cache
//!
//! A single key/value store with its own TTL and size bound.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the entry map and the byte total, so
//!   size accounting can never drift from the map contents
//! - Every write stamps a monotonically increasing sequence number; sweeps
//!   delete by `(key, seq)` so an entry refreshed after the sweep looked at
//!   it is left alone
//! - Overwrites never move `stored_at` backwards (last writer by timestamp wins)

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::entry::{is_fresh_at, CacheEntry, CacheKey};
use super::metrics::CacheMetrics;
use crate::config::CachePolicy;
use crate::error::{Error, Result};

/// Entry plus its write sequence
#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Slot>,
    total_bytes: u64,
    next_seq: u64,
}

/// Lightweight view of an entry used by maintenance sweeps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub stored_at: Option<DateTime<Utc>>,
    pub size: u64,
    /// Write sequence; later writes have larger values
    pub seq: u64,
}

impl EntryInfo {
    /// Untimed entries count as expired
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        !is_fresh_at(self.stored_at, ttl, now)
    }
}

/// Named cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub name: String,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub ttl_secs: u64,
}

/// A named, independently configured cache
#[derive(Debug)]
pub struct NamedCache {
    name: String,
    policy: CachePolicy,
    state: Mutex<CacheState>,
}

impl NamedCache {
    /// Create an empty cache
    pub fn new(name: impl Into<String>, policy: CachePolicy) -> Self {
        Self {
            name: name.into(),
            policy,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Get an entry
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().entries.get(key).map(|slot| slot.entry.clone())
    }

    /// Check if the cache holds a key
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Store an entry, replacing any previous entry for the same key.
    ///
    /// Returns `Ok(false)` when the resident entry is newer than `entry`
    /// and was kept instead.
    pub fn put(&self, entry: CacheEntry) -> Result<bool> {
        let size = entry.size();
        if size > self.policy.max_bytes {
            return Err(Error::EntryTooLarge {
                cache: self.name.clone(),
                size,
                capacity: self.policy.max_bytes,
            });
        }

        let mut state = self.state.lock();
        if let Some(existing) = state.entries.get(entry.key()) {
            if existing.entry.timestamp() > entry.timestamp() {
                debug!(cache = %self.name, key = %entry.key(), "Kept newer resident entry");
                return Ok(false);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let key = entry.key().clone();
        let old = state.entries.insert(key, Slot { entry, seq });

        let old_size = old.map(|slot| slot.entry.size()).unwrap_or(0);
        state.total_bytes = state.total_bytes - old_size + size;
        Ok(true)
    }

    /// Store an entry without surfacing failures.
    ///
    /// Every component writes through here: a failed write is logged and
    /// counted, and the caller carries on with the response it already has.
    pub fn put_best_effort(&self, entry: CacheEntry, metrics: &CacheMetrics) -> bool {
        let key = entry.key().clone();
        match self.put(entry) {
            Ok(applied) => applied,
            Err(e) => {
                metrics.record_storage_write_error();
                warn!(cache = %self.name, key = %key, error = %e, "Cache write failed");
                false
            }
        }
    }

    /// Remove an entry
    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let mut state = self.state.lock();
        let slot = state.entries.remove(key)?;
        state.total_bytes -= slot.entry.size();
        Some(slot.entry)
    }

    /// Remove an entry only if it has not been rewritten since `seq`.
    /// Returns the number of bytes freed.
    pub fn remove_if_unchanged(&self, key: &CacheKey, seq: u64) -> Option<u64> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(slot) if slot.seq == seq => {}
            _ => return None,
        }
        let slot = state.entries.remove(key)?;
        let size = slot.entry.size();
        state.total_bytes -= size;
        Some(size)
    }

    /// Snapshot of entry metadata, in write order
    pub fn entry_infos(&self) -> Vec<EntryInfo> {
        let state = self.state.lock();
        let mut infos: Vec<EntryInfo> = state
            .entries
            .iter()
            .map(|(key, slot)| EntryInfo {
                key: key.clone(),
                stored_at: slot.entry.timestamp(),
                size: slot.entry.size(),
                seq: slot.seq,
            })
            .collect();
        drop(state);
        infos.sort_by_key(|info| info.seq);
        infos
    }

    /// Clone of every entry, in write order
    pub fn entries(&self) -> Vec<CacheEntry> {
        let state = self.state.lock();
        let mut slots: Vec<(u64, CacheEntry)> = state
            .entries
            .values()
            .map(|slot| (slot.seq, slot.entry.clone()))
            .collect();
        drop(state);
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Re-insert previously saved entries; oversized ones are dropped
    pub fn restore(&self, entries: Vec<CacheEntry>) -> usize {
        let mut restored = 0;
        for entry in entries {
            match self.put(entry) {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => debug!(cache = %self.name, error = %e, "Skipped entry during restore"),
            }
        }
        restored
    }

    /// Remove everything, returning the number of entries dropped
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.entries.len();
        state.entries.clear();
        state.total_bytes = 0;
        count
    }

    /// Total payload bytes
    pub fn total_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            name: self.name.clone(),
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            max_bytes: self.policy.max_bytes,
            ttl_secs: self.policy.ttl.as_secs(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseMeta;
    use crate::request::Headers;
    use bytes::Bytes;
    use chrono::Duration as ChronoDuration;
    use url::Url;

    fn key(path: &str) -> CacheKey {
        CacheKey::for_url(&Url::parse(&format!("https://example.com{}", path)).unwrap())
    }

    fn entry_at(path: &str, size: usize, at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::stored_at(
            key(path),
            ResponseMeta {
                status: 200,
                headers: Headers::new(),
            },
            Bytes::from(vec![7u8; size]),
            at,
        )
    }

    fn cache(max_bytes: u64) -> NamedCache {
        NamedCache::new("edgecache-test-v1", CachePolicy::new(Duration::from_secs(60), max_bytes))
    }

    #[test]
    fn test_put_get_roundtrip() {
        let cache = cache(1024);
        let entry = entry_at("/a", 100, Utc::now());
        assert!(cache.put(entry.clone()).unwrap());

        let got = cache.get(&key("/a")).unwrap();
        assert_eq!(got.body(), entry.body());
        assert_eq!(got.size(), 100);
        assert_eq!(cache.total_bytes(), 100);
    }

    #[test]
    fn test_overwrite_adjusts_size() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.put(entry_at("/a", 100, now)).unwrap();
        cache.put(entry_at("/a", 40, now + ChronoDuration::seconds(1))).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 40);
    }

    #[test]
    fn test_older_write_does_not_replace_newer() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.put(entry_at("/a", 10, now)).unwrap();

        let applied = cache.put(entry_at("/a", 20, now - ChronoDuration::seconds(5))).unwrap();
        assert!(!applied);
        assert_eq!(cache.get(&key("/a")).unwrap().size(), 10);
        assert_eq!(cache.total_bytes(), 10);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = cache(50);
        let err = cache.put(entry_at("/big", 51, Utc::now())).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { size: 51, .. }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_best_effort_write_swallows_failure() {
        let cache = cache(50);
        let metrics = CacheMetrics::new();
        assert!(!cache.put_best_effort(entry_at("/big", 51, Utc::now()), &metrics));
        assert!(cache.put_best_effort(entry_at("/ok", 10, Utc::now()), &metrics));
        assert_eq!(metrics.snapshot().storage_write_errors, 1);
    }

    #[test]
    fn test_remove_if_unchanged_skips_rewritten_entry() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.put(entry_at("/a", 10, now)).unwrap();
        let seq = cache.entry_infos()[0].seq;

        // Entry is refreshed after the sweep took its snapshot
        cache.put(entry_at("/a", 12, now + ChronoDuration::seconds(1))).unwrap();

        assert_eq!(cache.remove_if_unchanged(&key("/a"), seq), None);
        assert_eq!(cache.total_bytes(), 12);

        let seq = cache.entry_infos()[0].seq;
        assert_eq!(cache.remove_if_unchanged(&key("/a"), seq), Some(12));
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_entry_infos_in_write_order() {
        let cache = cache(1024);
        let now = Utc::now();
        cache.put(entry_at("/c", 1, now)).unwrap();
        cache.put(entry_at("/a", 1, now)).unwrap();
        cache.put(entry_at("/b", 1, now)).unwrap();

        let order: Vec<String> = cache
            .entry_infos()
            .into_iter()
            .map(|info| info.key.url().to_string())
            .collect();
        assert_eq!(
            order,
            vec![
                "https://example.com/c",
                "https://example.com/a",
                "https://example.com/b"
            ]
        );
    }

    #[test]
    fn test_clear() {
        let cache = cache(1024);
        cache.put(entry_at("/a", 10, Utc::now())).unwrap();
        cache.put(entry_at("/b", 10, Utc::now())).unwrap();
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.total_bytes(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_info_expiry_matches_entry_freshness() {
        let cache = cache(1024);
        let now = Utc::now();
        let ttl = Duration::from_secs(60);
        cache.put(entry_at("/edge", 1, now - ChronoDuration::seconds(60))).unwrap();
        cache.put(entry_at("/young", 1, now - ChronoDuration::seconds(59))).unwrap();
        cache.put(entry_at("/ahead", 1, now + ChronoDuration::seconds(5))).unwrap();

        for info in cache.entry_infos() {
            let entry = cache.get(&info.key).unwrap();
            assert_eq!(info.is_expired(ttl, now), !entry.is_fresh(ttl, now), "{}", info.key);
        }
        assert!(cache.entry_infos()[0].is_expired(ttl, now));
    }
}
