//! Cache Entry Types
//!
//! Stored responses keyed by method + URL, with the timestamp that drives
//! TTL freshness and oldest-first size eviction.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::request::{Headers, Method, ResponseDescriptor, ServedFrom};

/// Cache key - method plus absolute URL, e.g. `GET https://host/path?q`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key for a method and URL
    pub fn new(method: &Method, url: &Url) -> Self {
        Self(format!("{} {}", method, url))
    }

    /// Key of a plain GET for `url`
    pub fn for_url(url: &Url) -> Self {
        Self::new(&Method::Get, url)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// URL part of the key
    pub fn url(&self) -> &str {
        self.0.split_once(' ').map(|(_, url)| url).unwrap_or(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response metadata kept alongside the payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
}

/// Cache entry containing payload and metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    key: CacheKey,
    meta: ResponseMeta,
    /// Absent on entries written by older versions; such entries are never fresh
    #[serde(default)]
    stored_at: Option<DateTime<Utc>>,
    body: Bytes,
}

impl CacheEntry {
    /// Create an entry stamped with the current time
    pub fn new(key: CacheKey, meta: ResponseMeta, body: Bytes) -> Self {
        Self::stored_at(key, meta, body, Utc::now())
    }

    /// Create an entry with an explicit store time
    pub fn stored_at(key: CacheKey, meta: ResponseMeta, body: Bytes, at: DateTime<Utc>) -> Self {
        Self {
            key,
            meta,
            stored_at: Some(at),
            body,
        }
    }

    /// Create an entry with no timestamp
    pub fn untimed(key: CacheKey, meta: ResponseMeta, body: Bytes) -> Self {
        Self {
            key,
            meta,
            stored_at: None,
            body,
        }
    }

    /// Capture a network response
    pub fn from_response(key: CacheKey, response: &ResponseDescriptor) -> Self {
        Self::new(
            key,
            ResponseMeta {
                status: response.status,
                headers: response.headers.clone(),
            },
            response.body.clone(),
        )
    }

    /// Rebuild a response for the caller
    pub fn to_response(&self, served_from: ServedFrom) -> ResponseDescriptor {
        ResponseDescriptor {
            status: self.meta.status,
            headers: self.meta.headers.clone(),
            body: self.body.clone(),
            served_from,
        }
    }

    #[inline]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    #[inline]
    pub fn meta(&self) -> &ResponseMeta {
        &self.meta
    }

    /// Payload (zero-copy)
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    #[inline]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.stored_at
    }

    /// Payload size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Time since the entry was stored; `None` without a timestamp
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        age_at(self.stored_at, now)
    }

    /// Strict `elapsed < ttl`; untimed entries are never fresh
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        is_fresh_at(self.stored_at, ttl, now)
    }

    /// Complement of [`CacheEntry::is_fresh`]
    #[inline]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        !self.is_fresh(ttl, now)
    }
}

/// Elapsed time since `stored_at`; clock skew into the future reads as zero
pub(crate) fn age_at(stored_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<Duration> {
    stored_at.map(|at| {
        now.signed_duration_since(at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    })
}

/// Freshness rule shared by entries and sweep snapshots
pub(crate) fn is_fresh_at(stored_at: Option<DateTime<Utc>>, ttl: Duration, now: DateTime<Utc>) -> bool {
    match age_at(stored_at, now) {
        Some(age) => age < ttl,
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn meta() -> ResponseMeta {
        ResponseMeta {
            status: 200,
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_cache_key_identity() {
        let a = CacheKey::new(&Method::Get, &url("https://example.com/a?x=1"));
        let b = CacheKey::for_url(&url("https://example.com/a?x=1"));
        let c = CacheKey::new(&Method::Head, &url("https://example.com/a?x=1"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "GET https://example.com/a?x=1");
        assert_eq!(a.url(), "https://example.com/a?x=1");
    }

    #[test]
    fn test_size_tracks_payload() {
        let key = CacheKey::for_url(&url("https://example.com/clip"));
        let entry = CacheEntry::new(key, meta(), Bytes::from_static(b"0123456789"));
        assert_eq!(entry.size(), 10);
    }

    #[test]
    fn test_freshness_is_strict() {
        let now = Utc::now();
        let key = CacheKey::for_url(&url("https://example.com/"));
        let ttl = Duration::from_secs(60);

        let at_boundary =
            CacheEntry::stored_at(key.clone(), meta(), Bytes::new(), now - ChronoDuration::seconds(60));
        assert!(!at_boundary.is_fresh(ttl, now));
        assert!(at_boundary.is_expired(ttl, now));

        let inside =
            CacheEntry::stored_at(key.clone(), meta(), Bytes::new(), now - ChronoDuration::seconds(59));
        assert!(inside.is_fresh(ttl, now));
    }

    #[test]
    fn test_untimed_entry_is_never_fresh() {
        let key = CacheKey::for_url(&url("https://example.com/"));
        let entry = CacheEntry::untimed(key, meta(), Bytes::new());
        assert!(entry.age(Utc::now()).is_none());
        assert!(!entry.is_fresh(Duration::from_secs(u64::MAX / 4), Utc::now()));
    }

    #[test]
    fn test_response_roundtrip() {
        let response = ResponseDescriptor::new(200, "hello").with_header("Content-Type", "text/plain");
        let key = CacheKey::for_url(&url("https://example.com/hello"));
        let entry = CacheEntry::from_response(key, &response);

        let served = entry.to_response(ServedFrom::Cache);
        assert_eq!(served.body, response.body);
        assert_eq!(served.headers.get("content-type").map(String::as_str), Some("text/plain"));
        assert_eq!(served.served_from, ServedFrom::Cache);
    }

    #[test]
    fn test_missing_timestamp_deserializes_as_untimed() {
        let json = r#"{"key":"GET https://example.com/","meta":{"status":200},"body":[104,105]}"#;
        let entry: CacheEntry = serde_json::from_str(json).unwrap();
        assert!(entry.timestamp().is_none());
        assert_eq!(entry.body().as_ref(), b"hi");
    }

    proptest! {
        /// Freshness equals `(now - stored_at) < ttl` for any age and ttl
        #[test]
        fn prop_is_fresh_matches_elapsed(age_secs in 0i64..10_000_000, ttl_secs in 1u64..10_000_000) {
            let now = Utc::now();
            let key = CacheKey::for_url(&url("https://example.com/p"));
            let entry = CacheEntry::stored_at(key, meta(), Bytes::new(), now - ChronoDuration::seconds(age_secs));
            let ttl = Duration::from_secs(ttl_secs);
            prop_assert_eq!(entry.is_fresh(ttl, now), (age_secs as u64) < ttl_secs);
        }
    }
}
