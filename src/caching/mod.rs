//! # Caching System Module
//!
//! Multi-backend caching for the retail backend: a Redis store with an
//! in-process fallback, a cache manager with cache-aside helpers and domain
//! invalidation, and a request deduplicator that collapses concurrent
//! identical outbound calls.
//!
//! ## Architecture
//! 1. **Cache Stores**: Redis and in-memory implementations behind [`CacheStore`]
//! 2. **Cache Backend**: the store selected once at construction ([`CacheBackend`])
//! 3. **Cache Manager**: typed get/set, `get_or_set`, key generation, invalidation helpers
//! 4. **Deduplication**: shared in-flight futures keyed by request fingerprint
//!
//! ## Usage Example
//! ```rust,no_run
//! use std::time::Duration;
//! use retail_cache::caching::CacheManager;
//! use retail_cache::core::config::CacheLayerConfig;
//!
//! # async fn example() -> Result<(), retail_cache::caching::CacheError> {
//! let manager = CacheManager::new(CacheLayerConfig::default()).await?;
//!
//! manager.set("reference:currencies", &vec!["USD", "EUR"], Some(Duration::from_secs(60))).await?;
//! let currencies: Option<Vec<String>> = manager.get("reference:currencies").await?;
//! # Ok(())
//! # }
//! ```

pub mod cache_manager;
pub mod deduplication;
pub mod http_client;
pub mod invalidation;
pub mod key_generator;
pub mod stores;

pub use cache_manager::{CacheManager, ManagerStats};
pub use deduplication::{request_key, DeduplicationConfig, DeduplicationError, DeduplicationStats, RequestDeduplicator};
pub use http_client::{DedupHttpClient, FetchError, FetchResponse, HttpFetch, OutboundRequest, ReqwestFetcher};
pub use key_generator::generate_key;
pub use stores::{BackendKind, CacheBackend, CacheEntry, CacheStore, CacheStoreStats, InMemoryCache, RedisCache};

use std::sync::Arc;

/// Cache operation result
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Invalid cache key: {message}")]
    InvalidKey { message: String },

    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Cache configuration error: {message}")]
    Configuration { message: String },

    /// Fetch-on-miss failure, shared between every waiter of a coalesced fetch
    #[error("Fetch failed: {0}")]
    Fetch(Arc<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    /// Errors caused by the caller's input rather than the cache itself
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::InvalidKey { .. } | Self::InvalidPattern(_) | Self::Configuration { .. }
        )
    }
}
