//! Caching Strategies
//!
//! Each strategy is a small state machine that ends in `Served` or `Failed`.
//!
//! ```text
//! CacheFirstWithTtl:        fresh hit ──▶ Served(cache)
//!                           miss/stale ──▶ fetch ──ok──▶ store ──▶ Served(network)
//!                                              └─err──▶ stale? ──▶ Served(stale) | Failed
//!
//! NetworkFirst*:            fetch ──ok──▶ store ──▶ Served(network)
//!                             └─err──▶ cached? ──▶ Served(stale)
//!                                        └─none──▶ navigation+offline? ──▶ Served(offline) | Failed
//!
//! StaleWhileRevalidate:     hit ──▶ Served(cached) + spawn refresh
//!                           miss ──▶ fetch ──ok──▶ store ──▶ Served(network)
//!                                      └─err──▶ Failed
//! ```

mod executor;

pub use executor::StrategyExecutor;

use std::fmt;

use crate::error::Error;
use crate::request::ResponseDescriptor;

/// Caching strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Serve a fresh cached entry, otherwise fetch; stale entry on failure
    CacheFirstWithTtl,
    /// Fetch first, cached entry on failure
    NetworkFirstWithCacheFallback,
    /// Fetch first, cached entry or offline page on failure
    NetworkFirstWithOfflineFallback,
    /// Serve cached entry immediately and refresh it in the background
    StaleWhileRevalidate,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::CacheFirstWithTtl => write!(f, "cache-first"),
            Strategy::NetworkFirstWithCacheFallback => write!(f, "network-first"),
            Strategy::NetworkFirstWithOfflineFallback => write!(f, "network-first-offline"),
            Strategy::StaleWhileRevalidate => write!(f, "stale-while-revalidate"),
        }
    }
}

/// How a served response was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeSource {
    /// Network response
    Network,
    /// Cached entry within its TTL
    FreshCache,
    /// Cached entry used because the network failed
    StaleCache,
    /// Cached entry served while a refresh runs in the background
    Revalidating,
    /// Reserved offline page
    Offline,
}

/// Terminal state of a strategy run
#[derive(Debug)]
pub enum Outcome {
    Served {
        response: ResponseDescriptor,
        source: ServeSource,
    },
    Failed(Error),
}

impl Outcome {
    pub(crate) fn served(response: ResponseDescriptor, source: ServeSource) -> Self {
        Outcome::Served { response, source }
    }

    pub fn is_served(&self) -> bool {
        matches!(self, Outcome::Served { .. })
    }

    pub fn source(&self) -> Option<ServeSource> {
        match self {
            Outcome::Served { source, .. } => Some(*source),
            Outcome::Failed(_) => None,
        }
    }

    /// Response, or the failure that prevented one
    pub fn into_result(self) -> Result<ResponseDescriptor, Error> {
        match self {
            Outcome::Served { response, .. } => Ok(response),
            Outcome::Failed(e) => Err(e),
        }
    }
}
