//! Network Fetcher
//!
//! The collaborator every strategy falls back to. Fetchers perform exactly
//! one attempt per call; retries and fallbacks belong to the strategy
//! executor.

mod http;
mod scripted;

pub use http::HttpFetcher;
pub use scripted::ScriptedFetcher;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{RequestDescriptor, ResponseDescriptor};

/// Network fetcher trait
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    /// Fetch a request. Any HTTP status is a response; only transport
    /// failures are errors.
    async fn fetch(&self, request: &RequestDescriptor) -> Result<ResponseDescriptor>;
}
