//! # Cache Stores Module
//!
//! Storage backends for the cache manager. Both the Redis store and the
//! in-process store implement [`CacheStore`]; [`CacheBackend`] picks one of
//! them once, at construction time, and dispatches to it for the lifetime of
//! the process.

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryCache, InMemoryCacheConfig};
pub use redis_store::{RedisCache, RedisCacheConfig};

use super::{CacheError, CacheResult};
use crate::core::config::CacheLayerConfig;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Longest TTL a store honours; longer TTLs are capped
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Cache entry with expiry metadata
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached value
    pub value: Vec<u8>,

    /// When the entry was created
    pub created_at: Instant,

    /// When the entry stops being served
    pub expires_at: Instant,

    /// Last read or write
    pub last_accessed: Instant,
}

impl CacheEntry {
    /// Create a new cache entry; the TTL is capped at [`MAX_TTL`]
    pub fn new(value: Vec<u8>, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now),
            last_accessed: now,
        }
    }

    /// An entry is expired from its `expires_at` instant onwards
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Mark the entry as accessed
    pub fn mark_accessed(&mut self) {
        self.last_accessed = Instant::now();
    }

    /// Time until expiration
    pub fn ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Approximate memory footprint in bytes
    pub fn size(&self) -> usize {
        self.value.len() + std::mem::size_of::<Self>()
    }
}

/// Trait for cache store implementations
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a value from the cache
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Set a value in the cache with TTL
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()>;

    /// Delete a value from the cache
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Delete every key matching a glob pattern (`*` wildcard), returning the count removed
    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize>;

    /// Check if a key exists in the cache
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Clear all entries from the cache
    async fn clear(&self) -> CacheResult<()>;

    /// Get cache statistics
    async fn stats(&self) -> CacheResult<CacheStoreStats>;

    /// Perform health check
    async fn health_check(&self) -> CacheResult<bool>;
}

/// Cache store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStoreStats {
    /// Number of entries
    pub entries: usize,

    /// Total memory usage in bytes
    pub memory_usage: usize,

    /// Number of hits
    pub hits: u64,

    /// Number of misses
    pub misses: u64,

    /// Number of evictions
    pub evictions: u64,

    /// Number of expired entries cleaned up
    pub expired_cleanups: u64,

    /// Whether the store currently has a working connection
    pub connected: bool,
}

/// Which backend a configuration selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

/// The backend chosen for this process
pub enum CacheBackend {
    Redis(RedisCache),
    Memory(InMemoryCache),
}

impl CacheBackend {
    /// Build the backend selected by the configuration
    ///
    /// The Redis store connects lazily, so construction never waits on the network.
    pub fn from_config(config: &CacheLayerConfig) -> CacheResult<Self> {
        let backend = match config.backend_kind() {
            BackendKind::Redis => Self::Redis(RedisCache::new(config.redis.clone())?),
            BackendKind::Memory => Self::Memory(InMemoryCache::new(config.memory.clone())),
        };
        info!(
            "Cache backend selected: {:?} (environment: {})",
            backend.kind(),
            config.environment
        );
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Redis(_) => BackendKind::Redis,
            Self::Memory(_) => BackendKind::Memory,
        }
    }

    /// Stop background work and release connections
    pub async fn shutdown(&self) {
        match self {
            Self::Redis(store) => store.disconnect().await,
            Self::Memory(store) => store.shutdown(),
        }
    }

    fn store(&self) -> &dyn CacheStore {
        match self {
            Self::Redis(store) => store,
            Self::Memory(store) => store,
        }
    }
}

#[async_trait]
impl CacheStore for CacheBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.store().get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.store().set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.store().delete(key).await
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        self.store().invalidate_pattern(pattern).await
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.store().exists(key).await
    }

    async fn clear(&self) -> CacheResult<()> {
        self.store().clear().await
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        self.store().stats().await
    }

    async fn health_check(&self) -> CacheResult<bool> {
        self.store().health_check().await
    }
}

/// Compile a glob pattern into an anchored regex; only `*` is special
pub(crate) fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(CacheError::from)
}

/// Escape text for Redis `MATCH`, keeping `*` as the only wildcard when `keep_star` is set
pub(crate) fn escape_redis_glob(text: &str, keep_star: bool) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '*' if keep_star => escaped.push('*'),
            '*' | '?' | '[' | ']' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("orders:*").unwrap();
        assert!(re.is_match("orders:1"));
        assert!(re.is_match("orders:"));
        assert!(!re.is_match("invoices:orders:1"));

        let re = glob_to_regex("inventory:list:*|category:3|*").unwrap();
        assert!(re.is_match("inventory:list:all|category:3|page:1|"));
        assert!(!re.is_match("inventory:list:all|category:33|page:1|"));

        // Regex metacharacters in the glob are literal
        let re = glob_to_regex("stats.daily:*").unwrap();
        assert!(re.is_match("stats.daily:1"));
        assert!(!re.is_match("statsXdaily:1"));
    }

    #[test]
    fn test_escape_redis_glob() {
        assert_eq!(escape_redis_glob("orders:*", true), "orders:*");
        assert_eq!(escape_redis_glob("sku?[1]:*", true), r"sku\?\[1\]:*");
        assert_eq!(escape_redis_glob(r"a\b", true), r"a\\b");
        assert_eq!(escape_redis_glob("prefix*:", false), r"prefix\*:");
    }

    #[tokio::test]
    async fn test_entry_with_huge_ttl_is_capped() {
        let entry = CacheEntry::new(b"value".to_vec(), Duration::MAX);
        assert!(!entry.is_expired());
        assert!(entry.ttl() <= MAX_TTL);
        assert!(entry.ttl() > MAX_TTL - Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let entry = CacheEntry::new(b"value".to_vec(), Duration::from_secs(10));
        assert!(!entry.is_expired());
        assert_eq!(entry.ttl(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(entry.is_expired());
        assert_eq!(entry.ttl(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_backend_from_default_config_is_memory() {
        let backend = CacheBackend::from_config(&CacheLayerConfig::default()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);

        backend.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));
        backend.shutdown().await;
    }
}
