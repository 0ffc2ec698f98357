//! Scripted fetcher
//!
//! Deterministic in-process fetcher with per-URL canned responses, an
//! offline switch and call counting. Used by tests and local demos.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::NetworkFetcher;
use crate::error::{Error, Result};
use crate::request::{RequestDescriptor, ResponseDescriptor};

#[derive(Debug, Clone)]
enum Scripted {
    Respond(ResponseDescriptor),
    Fail(String),
}

/// Fetcher answering from a script instead of the network
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    routes: DashMap<String, Scripted>,
    calls: DashMap<String, u64>,
    total_calls: AtomicU64,
    offline: AtomicBool,
    latency: RwLock<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with `status` and `body`
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.respond_with(url, ResponseDescriptor::new(status, body));
    }

    /// Answer `url` with a prepared response
    pub fn respond_with(&self, url: &str, response: ResponseDescriptor) {
        self.routes.insert(url.to_string(), Scripted::Respond(response));
    }

    /// Fail every fetch of `url`
    pub fn fail(&self, url: &str, reason: &str) {
        self.routes
            .insert(url.to_string(), Scripted::Fail(reason.to_string()));
    }

    /// Fail every fetch while offline
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every fetch by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Fetches issued for `url`
    pub fn calls(&self, url: &str) -> u64 {
        self.calls.get(url).map(|c| *c).unwrap_or(0)
    }

    /// Fetches issued in total
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NetworkFetcher for ScriptedFetcher {
    async fn fetch(&self, request: &RequestDescriptor) -> Result<ResponseDescriptor> {
        let url = request.url.as_str().to_string();
        *self.calls.entry(url.clone()).or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network {
                url,
                reason: "offline".to_string(),
            });
        }

        let scripted = self.routes.get(&url).map(|route| route.clone());
        match scripted {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(reason)) => Err(Error::Network { url, reason }),
            None => Ok(ResponseDescriptor::new(404, "not found")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_and_counts() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("https://example.com/a", 200, "alpha");
        fetcher.fail("https://example.com/b", "reset");

        let a = RequestDescriptor::get("https://example.com/a").unwrap();
        let b = RequestDescriptor::get("https://example.com/b").unwrap();
        let c = RequestDescriptor::get("https://example.com/c").unwrap();

        assert_eq!(fetcher.fetch(&a).await.unwrap().body.as_ref(), b"alpha");
        assert!(fetcher.fetch(&b).await.unwrap_err().is_network());
        assert_eq!(fetcher.fetch(&c).await.unwrap().status, 404);
        assert_eq!(fetcher.calls("https://example.com/a"), 1);
        assert_eq!(fetcher.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_offline_switch() {
        let fetcher = ScriptedFetcher::new();
        fetcher.respond("https://example.com/a", 200, "alpha");
        fetcher.set_offline(true);

        let a = RequestDescriptor::get("https://example.com/a").unwrap();
        assert!(fetcher.fetch(&a).await.is_err());

        fetcher.set_offline(false);
        assert!(fetcher.fetch(&a).await.is_ok());
    }
}
