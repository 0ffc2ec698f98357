//! Named Response Caches
//!
//! A registry of independently configured key/value stores, one per cache
//! kind, each with its own TTL and size bound.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Cache Registry                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  edgecache-audio-v1  │ edgecache-html-v1 │ edgecache-api-v1 │  ...        │
//! │  ┌────────────────┐  │ ┌───────────────┐ │ ┌──────────────┐ │             │
//! │  │ Mutex<entries> │  │ │ Mutex<entries>│ │ │Mutex<entries>│ │             │
//! │  │ ttl 30d, 500MB │  │ │ ttl 1d, 50MB  │ │ │ ttl 5m, 10MB │ │             │
//! │  └────────────────┘  │ └───────────────┘ │ └──────────────┘ │             │
//! │         │                    │                   │                        │
//! │         └────────────────────┴───────────────────┘                        │
//! │                              │                                            │
//! │                 Durable Storage (load / save at boundaries)               │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - One mutex per named cache; reads and writes of a key are linearizable
//! - Payloads are `Bytes`, so reads hand out cheap clones
//! - Size accounting is updated under the same lock as the entry map

mod entry;
mod metrics;
mod named;
mod registry;
pub mod storage;

pub use entry::{CacheEntry, CacheKey, ResponseMeta};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use named::{CacheStats, EntryInfo, NamedCache};
pub use registry::CacheRegistry;
pub use storage::{DurableStorage, InMemoryStorage, JsonFileStorage};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Logical cache kinds the engine routes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Audio clips and signed media URLs
    Audio,
    /// HTML documents
    Html,
    /// API responses
    Api,
    /// Images, fonts, styles and scripts
    Static,
    /// Everything else
    Default,
    /// Background-prefetched resources
    Prefetch,
}

impl CacheKind {
    /// Every kind known to the current version
    pub const ALL: [CacheKind; 6] = [
        CacheKind::Audio,
        CacheKind::Html,
        CacheKind::Api,
        CacheKind::Static,
        CacheKind::Default,
        CacheKind::Prefetch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Audio => "audio",
            CacheKind::Html => "html",
            CacheKind::Api => "api",
            CacheKind::Static => "static",
            CacheKind::Default => "default",
            CacheKind::Prefetch => "prefetch",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::CacheNotFound(s.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip_through_str() {
        for kind in CacheKind::ALL {
            assert_eq!(kind.as_str().parse::<CacheKind>().unwrap(), kind);
        }
        assert_eq!("AUDIO".parse::<CacheKind>().unwrap(), CacheKind::Audio);
        assert!("video".parse::<CacheKind>().is_err());
    }
}
