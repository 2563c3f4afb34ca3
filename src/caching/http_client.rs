//! # Deduplicating HTTP Client
//!
//! Wraps an outbound HTTP transport so concurrent identical requests share a
//! single round trip. Requests are keyed with [`request_key`] over method,
//! URL, body and headers, so a double-submitted identical POST collapses into
//! one call too. [`DedupHttpClient::safe_methods_only`] restricts coalescing
//! to `GET` and `HEAD`.
//!
//! The request key ignores the `Authorization` header, so two users issuing
//! the same GET at the same moment share one response. Enable
//! [`DedupHttpClient::partition_by_credentials`] when responses depend on
//! the caller.

use super::deduplication::{request_key, DeduplicationConfig, DeduplicationStats, RequestDeduplicator};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Outbound request description
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// GET and HEAD never change server state
    pub fn is_safe(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD")
    }

    fn authorization(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("authorization"))
            .map(|(_, value)| value.as_str())
    }
}

/// Response shared between coalesced callers
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_slice(&self.body).map_err(|e| FetchError::Decode {
            message: e.to_string(),
        })
    }
}

/// Transport errors; cloneable so every waiter receives the same failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request failed: {message}")]
    Transport { message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Failed to decode response: {message}")]
    Decode { message: String },
}

/// Outbound HTTP transport
#[async_trait]
pub trait HttpFetch: Send + Sync + 'static {
    async fn fetch(&self, request: OutboundRequest) -> Result<FetchResponse, FetchError>;
}

/// [`HttpFetch`] backed by a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    async fn fetch(&self, request: OutboundRequest) -> Result<FetchResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            FetchError::InvalidRequest {
                message: format!("Invalid method {}: {}", request.method, e),
            }
        })?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in &request.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                FetchError::InvalidRequest {
                    message: format!("Invalid header name {}: {}", name, e),
                }
            })?;
            let value = reqwest::header::HeaderValue::from_str(value).map_err(|e| {
                FetchError::InvalidRequest {
                    message: format!("Invalid header value: {}", e),
                }
            })?;
            headers.append(name, value);
        }

        let mut builder = self.client.request(method, &request.url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(FetchResponse { status, headers, body })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport {
            message: error.to_string(),
        }
    }
}

/// HTTP client that coalesces concurrent identical requests
pub struct DedupHttpClient<F: HttpFetch> {
    fetcher: Arc<F>,
    dedup: RequestDeduplicator<Result<FetchResponse, FetchError>>,
    partition_by_credentials: bool,
    safe_methods_only: bool,
}

impl<F: HttpFetch> DedupHttpClient<F> {
    pub fn new(fetcher: F, config: DeduplicationConfig) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            dedup: RequestDeduplicator::new(config),
            partition_by_credentials: false,
            safe_methods_only: false,
        }
    }

    /// Only coalesce requests that carry the same `Authorization` value
    pub fn partition_by_credentials(mut self, enabled: bool) -> Self {
        self.partition_by_credentials = enabled;
        self
    }

    /// Send every method other than `GET` and `HEAD` straight to the transport
    pub fn safe_methods_only(mut self, enabled: bool) -> Self {
        self.safe_methods_only = enabled;
        self
    }

    pub async fn send(&self, request: OutboundRequest) -> Result<FetchResponse, FetchError> {
        if self.safe_methods_only && !request.is_safe() {
            return self.fetcher.fetch(request).await;
        }

        let key = self.key_for(&request);
        debug!("Outbound {} {} as {}", request.method, request.url, key);

        let fetcher = self.fetcher.clone();
        self.dedup
            .deduplicate(&key, move || async move { fetcher.fetch(request).await })
            .await
    }

    pub fn stats(&self) -> DeduplicationStats {
        self.dedup.stats()
    }

    pub async fn shutdown(&self) {
        self.dedup.shutdown().await;
    }

    fn key_for(&self, request: &OutboundRequest) -> String {
        let key = request_key(
            &request.method,
            &request.url,
            request.body.as_deref(),
            request.headers.iter().map(|(n, v)| (n.as_str(), v.as_str())),
        );

        match (self.partition_by_credentials, request.authorization()) {
            (true, Some(credentials)) => {
                let digest = hex::encode(Sha256::digest(credentials.as_bytes()));
                format!("{}:{}", key, &digest[..16])
            }
            _ => key,
        }
    }
}
