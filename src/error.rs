//! Error types for the edge cache engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the edge cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Network Errors
    // =========================================================================
    /// Fetch failed before a response was obtained
    #[error("Network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// Fetch did not complete within the configured timeout
    #[error("Network timeout fetching {url}")]
    NetworkTimeout { url: String },

    /// HTTP client construction or transport error
    #[error("HTTP client error: {0}")]
    Http(#[source] reqwest::Error),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Cache read/write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Entry does not fit into the cache at all
    #[error("Entry of {size} bytes exceeds capacity {capacity} of cache {cache}")]
    EntryTooLarge {
        cache: String,
        size: u64,
        capacity: u64,
    },

    /// No cache entry and no network response
    #[error("No cached or network response for {key}: {cause}")]
    NotFound { key: String, cause: String },

    /// Named cache does not exist
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    // =========================================================================
    // Request / Lifecycle Errors
    // =========================================================================
    /// Request descriptor could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Engine is not accepting requests yet
    #[error("Engine is not active (state: {state})")]
    NotActive { state: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error came from the network fetcher
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Error::Network { .. } | Error::NetworkTimeout { .. } | Error::Http(_)
        )
    }

    /// Neither the network nor the cache could answer
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Whether the error came from cache storage
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::EntryTooLarge { .. } | Error::Io(_) | Error::Serialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_classification() {
        let err = Error::Network {
            url: "https://example.com/".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(err.is_network());
        assert!(!err.is_storage());

        let err = Error::NetworkTimeout {
            url: "https://example.com/".to_string(),
        };
        assert!(err.is_network());
    }

    #[test]
    fn test_not_found_keeps_cause() {
        let err = Error::NotFound {
            key: "GET https://example.com/a".to_string(),
            cause: "offline".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_network());
        assert_eq!(
            err.to_string(),
            "No cached or network response for GET https://example.com/a: offline"
        );
    }

    #[test]
    fn test_storage_classification() {
        let err = Error::EntryTooLarge {
            cache: "edgecache-audio-v1".to_string(),
            size: 10,
            capacity: 5,
        };
        assert!(err.is_storage());
        assert!(!err.is_network());
        assert_eq!(
            err.to_string(),
            "Entry of 10 bytes exceeds capacity 5 of cache edgecache-audio-v1"
        );
    }
}
