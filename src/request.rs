//! Request and Response Descriptors
//!
//! Transport-neutral views of an inbound request and the response handed
//! back to the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheKey;
use crate::error::{Error, Result};

/// Header map with lower-cased names
pub type Headers = BTreeMap<String, String>;

// =============================================================================
// Request Attributes
// =============================================================================

/// HTTP method
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Ok(match upper.as_str() {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "PATCH" => Method::Patch,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "" => return Err(Error::InvalidRequest("empty method".to_string())),
            _ => Method::Other(upper),
        })
    }
}

/// Declared content destination of a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    #[default]
    Empty,
    Document,
    Audio,
    Video,
    Image,
    Font,
    Style,
    Script,
    Manifest,
}

impl Destination {
    /// Image, font, style or script
    pub fn is_static_asset(&self) -> bool {
        matches!(
            self,
            Destination::Image | Destination::Font | Destination::Style | Destination::Script
        )
    }
}

/// Request mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// Scheduling hint for the network fetcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchPriority {
    #[default]
    Normal,
    Low,
}

// =============================================================================
// Request Descriptor
// =============================================================================

/// Inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub destination: Destination,
    pub mode: RequestMode,
    pub priority: FetchPriority,
}

impl RequestDescriptor {
    /// Build a request from a method and an absolute URL
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidRequest(format!("invalid url '{}': {}", url, e)))?;
        Ok(Self::from_url(method, url))
    }

    /// Build a request from an already-parsed URL
    pub fn from_url(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            destination: Destination::Empty,
            mode: RequestMode::Cors,
            priority: FetchPriority::Normal,
        }
    }

    /// Plain GET request
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::Get, url)
    }

    /// Top-level document navigation
    pub fn navigate(url: &str) -> Result<Self> {
        Ok(Self::get(url)?
            .with_header("accept", "text/html,application/xhtml+xml")
            .with_destination(Destination::Document)
            .with_mode(RequestMode::Navigate))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_priority(mut self, priority: FetchPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    pub fn accepts_html(&self) -> bool {
        self.header("accept")
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false)
    }

    /// Identity of this request inside a cache
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

// =============================================================================
// Response Descriptor
// =============================================================================

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedFrom {
    Fresh,
    Cache,
    Offline,
}

impl fmt::Display for ServedFrom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServedFrom::Fresh => write!(f, "fresh"),
            ServedFrom::Cache => write!(f, "cache"),
            ServedFrom::Offline => write!(f, "offline"),
        }
    }
}

/// Response handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDescriptor {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
    pub served_from: ServedFrom,
}

impl ResponseDescriptor {
    /// Response obtained from the network
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
            served_from: ServedFrom::Fresh,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn served_from(mut self, served_from: ServedFrom) -> Self {
        self.served_from = served_from;
        self
    }

    /// HTTP 200
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Structured 503 payload returned to API callers when offline
    pub fn offline_api_error(message: &str) -> Self {
        let body = serde_json::json!({
            "error": "Offline",
            "message": message,
        });
        Self::new(503, body.to_string())
            .with_header("content-type", "application/json")
            .served_from(ServedFrom::Offline)
    }
}

// =============================================================================
// Tests
// =============================================================================
