//! HTTP fetcher backed by reqwest

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use super::NetworkFetcher;
use crate::error::{Error, Result};
use crate::request::{FetchPriority, Headers, RequestDescriptor, ResponseDescriptor};

/// Fetches over HTTP(S) with a per-request timeout
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with the given timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edgecache/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::Http)?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn map_error(url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::NetworkTimeout {
                url: url.to_string(),
            }
        } else {
            Error::Network {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn fetch(&self, request: &RequestDescriptor) -> Result<ResponseDescriptor> {
        let url = request.url.as_str();
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("invalid method: {}", e)))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.priority == FetchPriority::Low {
            builder = builder.header("priority", "u=5, i");
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_error(url, e))?;

        debug!(status, bytes = body.len(), "Fetched");
        Ok(ResponseDescriptor {
            headers,
            ..ResponseDescriptor::new(status, body)
        })
    }
}
