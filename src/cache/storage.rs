//! Durable Storage
//!
//! Optional collaborator that persists named caches across restarts. It is
//! only touched at process start (restore) and shutdown (save), never on the
//! request path.
//!
//! # Design
//!
//! - Pluggable backend behind an async trait
//! - `InMemoryStorage` for tests, `JsonFileStorage` for a local directory

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::entry::CacheEntry;
use crate::error::{Error, Result};

/// Durable storage backend trait
#[async_trait]
pub trait DurableStorage: Send + Sync {
    /// Names of every persisted cache
    async fn list(&self) -> Result<Vec<String>>;

    /// Load the entries of a cache; unknown names yield an empty list
    async fn load(&self, name: &str) -> Result<Vec<CacheEntry>>;

    /// Replace the persisted entries of a cache
    async fn save(&self, name: &str, entries: &[CacheEntry]) -> Result<()>;

    /// Forget a cache
    async fn remove(&self, name: &str) -> Result<bool>;
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// In-memory backend for testing
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    caches: DashMap<String, Vec<CacheEntry>>,
    saves: AtomicU64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of save calls served
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableStorage for InMemoryStorage {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.caches.iter().map(|c| c.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<Vec<CacheEntry>> {
        Ok(self
            .caches
            .get(name)
            .map(|entries| entries.clone())
            .unwrap_or_default())
    }

    async fn save(&self, name: &str, entries: &[CacheEntry]) -> Result<()> {
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.caches.insert(name.to_string(), entries.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.caches.remove(name).is_some())
    }
}

// =============================================================================
// JSON File Backend
// =============================================================================

const SNAPSHOT_EXT: &str = "json";

/// One JSON snapshot file per cache inside a directory
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    /// Use `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if !valid {
            return Err(Error::Storage(format!("invalid cache name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.{}", name, SNAPSHOT_EXT)))
    }
}

#[async_trait]
impl DurableStorage for JsonFileStorage {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn load(&self, name: &str) -> Result<Vec<CacheEntry>> {
        let path = self.path_for(name)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<CacheEntry> = serde_json::from_slice(&raw)?;
        debug!(cache = %name, entries = entries.len(), "Loaded cache snapshot");
        Ok(entries)
    }

    async fn save(&self, name: &str, entries: &[CacheEntry]) -> Result<()> {
        let path = self.path_for(name)?;
        let raw = serde_json::to_vec(entries)?;

        // Write-then-rename so a crash never leaves a torn snapshot
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(cache = %name, entries = entries.len(), "Saved cache snapshot");
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, ResponseMeta};
    use crate::request::Headers;
    use bytes::Bytes;
    use url::Url;

    fn entry(path: &str, body: &'static [u8]) -> CacheEntry {
        let url = Url::parse(&format!("https://example.com{}", path)).unwrap();
        CacheEntry::new(
            CacheKey::for_url(&url),
            ResponseMeta {
                status: 200,
                headers: Headers::new(),
            },
            Bytes::from_static(body),
        )
    }

    #[tokio::test]
    async fn test_in_memory_save_load() {
        let storage = InMemoryStorage::new();
        storage
            .save("edgecache-api-v1", &[entry("/a", b"one"), entry("/b", b"two")])
            .await
            .unwrap();

        let loaded = storage.load("edgecache-api-v1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(storage.list().await.unwrap(), vec!["edgecache-api-v1".to_string()]);
        assert!(storage.load("missing").await.unwrap().is_empty());
        assert_eq!(storage.save_count(), 1);
    }

    #[tokio::test]
    async fn test_json_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path()).await.unwrap();

        let saved = vec![entry("/clip", b"\x00\x01\x02audio")];
        storage.save("edgecache-audio-v1", &saved).await.unwrap();

        let loaded = storage.load("edgecache-audio-v1").await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(storage.list().await.unwrap(), vec!["edgecache-audio-v1".to_string()]);

        assert!(storage.remove("edgecache-audio-v1").await.unwrap());
        assert!(!storage.remove("edgecache-audio-v1").await.unwrap());
        assert!(storage.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_file_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::open(dir.path()).await.unwrap();

        let err = storage.save("../escape", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }
}
