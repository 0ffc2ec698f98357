//! edgecache - Multi-tier Response Cache and Offline Delivery Engine
//!
//! Sits between a client and the network. Every request is classified into a
//! named cache and a caching strategy; responses are stored with their
//! timestamp, served fresh, stale or offline as connectivity allows, and kept
//! within per-cache TTL and size bounds by background maintenance.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────┐   Bypass
//! request ───▶ │ Classifier │ ─────────────────────────────▶ NetworkFetcher
//!              └─────┬──────┘
//!                    │ (cache, strategy)
//!              ┌─────▼──────────────┐       ┌───────────────┐
//!              │ StrategyExecutor   │ ◀───▶ │ CacheRegistry │ ◀── EvictionManager
//!              │  + revalidations   │       │  NamedCache*  │ ◀── PrefetchQueue
//!              └─────┬──────────────┘       └───────┬───────┘
//!                    │                              │ restore / save
//!                    ▼                              ▼
//!              NetworkFetcher                DurableStorage
//! ```
//!
//! The [`Engine`] owns every component and walks them through
//! install, activate, serve and shutdown.
//!
//! # Modules
//!
//! - [`cache`] - Entries, named caches, the registry, metrics and durable storage
//! - [`classifier`] - Request classification rules
//! - [`config`] - Engine configuration and duration parsing
//! - [`error`] - Error types
//! - [`eviction`] - TTL and size sweeps
//! - [`fetcher`] - Network fetcher trait and implementations
//! - [`lifecycle`] - Engine facade and lifecycle states
//! - [`prefetch`] - Background prefetching
//! - [`request`] - Request and response descriptors
//! - [`strategy`] - Caching strategies and their executor

pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod eviction;
pub mod fetcher;
pub mod lifecycle;
pub mod prefetch;
pub mod request;
pub mod strategy;

// Re-export commonly used types
pub use cache::{
    CacheEntry, CacheKey, CacheKind, CacheMetrics, CacheRegistry, CacheStats, DurableStorage,
    InMemoryStorage, JsonFileStorage, MetricsSnapshot, NamedCache,
};
pub use classifier::{Classification, RequestClassifier};
pub use config::{CachePolicy, EngineConfig};
pub use error::{Error, Result};
pub use eviction::{EvictionManager, SweepReport};
pub use fetcher::{HttpFetcher, NetworkFetcher, ScriptedFetcher};
pub use lifecycle::{ActivationReport, Engine, EngineStats, InstallReport, LifecycleState};
pub use prefetch::{PrefetchQueue, PrefetchSummary};
pub use request::{Destination, Method, RequestDescriptor, RequestMode, ResponseDescriptor, ServedFrom};
pub use strategy::{Outcome, ServeSource, Strategy, StrategyExecutor};
