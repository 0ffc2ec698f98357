//! Engine Configuration
//!
//! Per-cache TTL and size policies, maintenance cadence, cache-name
//! versioning and classifier patterns. Loaded from YAML or built from
//! [`EngineConfig::default`].
//!
//! ```yaml
//! namespace: edgecache
//! version: v2
//! maintenance_interval: 1h
//! hysteresis: 0.9
//! caches:
//!   audio: { ttl: 30d, max_bytes: 524288000 }
//!   api:   { ttl: 5m,  max_bytes: 10485760 }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheKind;
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;
const DAY: u64 = 24 * 60 * 60;

/// Default maintenance interval (1 hour)
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default eviction hysteresis fraction
pub const DEFAULT_HYSTERESIS: f64 = 0.9;

// =============================================================================
// Cache Policy
// =============================================================================

/// TTL and size bound of a single named cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Maximum age before an entry is stale
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    /// Size bound enforced by the size sweep
    pub max_bytes: u64,
}

impl CachePolicy {
    pub const fn new(ttl: Duration, max_bytes: u64) -> Self {
        Self { ttl, max_bytes }
    }

    /// Built-in policy for a cache kind
    pub fn default_for(kind: CacheKind) -> Self {
        match kind {
            CacheKind::Audio => Self::new(Duration::from_secs(30 * DAY), 500 * MIB),
            CacheKind::Html => Self::new(Duration::from_secs(DAY), 50 * MIB),
            CacheKind::Api => Self::new(Duration::from_secs(5 * 60), 10 * MIB),
            CacheKind::Static => Self::new(Duration::from_secs(30 * DAY), 100 * MIB),
            CacheKind::Default => Self::new(Duration::from_secs(DAY), 50 * MIB),
            CacheKind::Prefetch => Self::new(Duration::from_secs(7 * DAY), 100 * MIB),
        }
    }
}

// =============================================================================
// Precache
// =============================================================================

/// Critical assets fetched during install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecacheConfig {
    /// Stored into the static cache
    pub static_assets: Vec<String>,
    /// Stored into the html cache
    pub pages: Vec<String>,
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            static_assets: vec!["/manifest.json".to_string()],
            pages: vec!["/".to_string()],
        }
    }
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Cache-name prefix owned by this engine
    pub namespace: String,

    /// Version tag carried by every cache name
    pub version: String,

    /// Origin that relative precache paths resolve against
    pub origin: String,

    /// Per-cache overrides; missing kinds use [`CachePolicy::default_for`]
    pub caches: BTreeMap<CacheKind, CachePolicy>,

    /// Interval of the recurring maintenance sweep
    #[serde(with = "duration_str")]
    pub maintenance_interval: Duration,

    /// Fill ratio a size sweep reduces usage to
    pub hysteresis: f64,

    /// Entries deleted per lock acquisition during sweeps
    pub sweep_batch_size: usize,

    /// Path prefixes routed to the api cache
    pub api_path_prefixes: Vec<String>,

    /// Hostname suffixes routed to the api cache
    pub api_hosts: Vec<String>,

    /// Query parameters that mark a signed media URL
    pub signed_token_params: Vec<String>,

    /// Assets fetched during install
    pub precache: PrecacheConfig,

    /// Reserved offline page served to failed navigations
    pub offline_page: String,

    /// Per-fetch timeout of the HTTP fetcher
    #[serde(with = "duration_str")]
    pub fetch_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "edgecache".to_string(),
            version: "v1".to_string(),
            origin: "http://localhost:8080".to_string(),
            caches: BTreeMap::new(),
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            hysteresis: DEFAULT_HYSTERESIS,
            sweep_batch_size: 64,
            api_path_prefixes: vec![
                "/api/".to_string(),
                "/rest/".to_string(),
                "/functions/".to_string(),
            ],
            api_hosts: Vec::new(),
            signed_token_params: vec!["token".to_string()],
            precache: PrecacheConfig::default(),
            offline_page: "/offline.html".to_string(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Reject configurations the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(Error::Config(format!(
                "invalid namespace '{}'",
                self.namespace
            )));
        }
        if self.version.is_empty() || self.version.contains('/') {
            return Err(Error::Config(format!("invalid version '{}'", self.version)));
        }
        if !(self.hysteresis > 0.0 && self.hysteresis <= 1.0) {
            return Err(Error::Config(format!(
                "hysteresis must be in (0, 1], got {}",
                self.hysteresis
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::Config("maintenance_interval must be > 0".to_string()));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::Config("sweep_batch_size must be > 0".to_string()));
        }
        for (kind, policy) in &self.caches {
            if policy.ttl.is_zero() {
                return Err(Error::Config(format!("cache '{}' has zero ttl", kind)));
            }
            if policy.max_bytes == 0 {
                return Err(Error::Config(format!("cache '{}' has zero max_bytes", kind)));
            }
        }
        self.origin_url()?;
        self.offline_page_url()?;
        Ok(())
    }

    /// Effective policy for a cache kind
    pub fn policy_for(&self, kind: CacheKind) -> CachePolicy {
        self.caches
            .get(&kind)
            .copied()
            .unwrap_or_else(|| CachePolicy::default_for(kind))
    }

    /// Full, versioned cache name, e.g. `edgecache-audio-v1`
    pub fn cache_name(&self, kind: CacheKind) -> String {
        format!("{}-{}-{}", self.namespace, kind, self.version)
    }

    /// Prefix shared by every cache this namespace owns
    pub fn namespace_prefix(&self) -> String {
        format!("{}-", self.namespace)
    }

    /// Parsed origin
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| Error::Config(format!("invalid origin '{}': {}", self.origin, e)))
    }

    /// Resolve a possibly-relative asset path against the origin
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin_url()?
            .join(path)
            .map_err(|e| Error::Config(format!("invalid asset path '{}': {}", path, e)))
    }

    /// Absolute URL of the reserved offline page
    pub fn offline_page_url(&self) -> Result<Url> {
        self.resolve(&self.offline_page)
    }
}

// =============================================================================
// Duration Parsing
// =============================================================================

/// Parse a duration string like "30d", "1h", "5m", "90s" or "1h30m".
/// A trailing bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_secs: u64 = 0;
    let mut num_buf = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'd' | 'D' => DAY,
            'h' | 'H' => 3600,
            'm' | 'M' => 60,
            's' | 'S' => 1,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };
        total_secs = num
            .checked_mul(multiplier)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(|| overflow(s))?;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_secs = total_secs.checked_add(num).ok_or_else(|| overflow(s))?;
    }

    if total_secs == 0 {
        return Err(Error::DurationParse(
            "duration must be greater than 0".to_string(),
        ));
    }

    Ok(Duration::from_secs(total_secs))
}

fn overflow(s: &str) -> Error {
    Error::DurationParse(format!("duration out of range: {}", s))
}

/// Serde adapter storing durations as "<secs>s" strings
mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
