//! # Cache Manager
//!
//! Typed cache-aside API over the selected [`CacheBackend`]. Values are JSON
//! at the manager boundary. Backend failures never reach callers: they are
//! logged and degrade to a miss or a no-op. Only caller-input problems (bad
//! key, unserialisable value, fetcher failure in `get_or_set`) are returned.

use super::deduplication::{DeduplicationStats, RequestDeduplicator};
use super::invalidation::InvalidationEvent;
use super::key_generator;
use super::{BackendKind, CacheBackend, CacheError, CacheResult, CacheStore, CacheStoreStats};
use crate::core::config::{CacheCategory, CacheLayerConfig, TtlConfig};
use crate::core::error::LayerError;
use bytes::Bytes;
use futures::future::join_all;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settled output of a coalesced `get_or_set` miss
type SharedLoad = Result<Bytes, Arc<CacheError>>;

/// Cache manager statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    pub backend: BackendKind,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub deletes: u64,
    /// Keys removed through pattern invalidation
    pub invalidated: u64,
    /// Backend failures degraded to miss/no-op
    pub degraded_operations: u64,
    pub fetches: u64,
    pub store: CacheStoreStats,
    pub coalescing: Option<DeduplicationStats>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidated: AtomicU64,
    degraded: AtomicU64,
    fetches: AtomicU64,
}

/// Cache manager
pub struct CacheManager {
    backend: Arc<CacheBackend>,
    ttl: TtlConfig,
    max_key_length: usize,
    coalescer: Option<RequestDeduplicator<SharedLoad>>,
    counters: Arc<Counters>,
}

impl CacheManager {
    /// Validate the configuration and create a manager with the backend it selects
    pub async fn new(config: CacheLayerConfig) -> CacheResult<Self> {
        config.validate().map_err(|e| match e {
            LayerError::Configuration { message } => CacheError::Configuration { message },
            other => CacheError::Configuration {
                message: other.to_string(),
            },
        })?;

        let backend = CacheBackend::from_config(&config)?;
        Ok(Self::with_backend(backend, &config))
    }

    /// Create a cache manager around an already constructed backend
    pub fn with_backend(backend: CacheBackend, config: &CacheLayerConfig) -> Self {
        let coalescer = config
            .coalesce_get_or_set
            .then(|| RequestDeduplicator::new(config.deduplication.clone()));

        info!(
            "Cache manager initialized (backend: {:?}, coalescing: {})",
            backend.kind(),
            coalescer.is_some()
        );

        Self {
            backend: Arc::new(backend),
            ttl: config.ttl.clone(),
            max_key_length: config.max_key_length,
            coalescer,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn ttl(&self) -> &TtlConfig {
        &self.ttl
    }

    pub fn ttl_for(&self, category: CacheCategory) -> Duration {
        self.ttl.for_category(category)
    }

    /// Get a typed value; an undecodable stored value is a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        self.validate_key(key)?;

        let Some(bytes) = self.get_raw(key).await else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Discarding undecodable cache value for key {}: {}", key, e);
                self.counters.hits.fetch_sub(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store a typed value; `None` uses the default TTL
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        self.validate_key(key)?;
        let bytes = serde_json::to_vec(value)?;
        let ttl = ttl.unwrap_or(self.ttl.default);

        store_quietly(&self.backend, &self.counters, key, &bytes, ttl).await;
        Ok(())
    }

    /// Delete a key, returning whether it was present
    pub async fn del(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;

        match self.backend.delete(key).await {
            Ok(deleted) => {
                self.counters.deletes.fetch_add(1, Ordering::Relaxed);
                Ok(deleted)
            }
            Err(e) => {
                self.degraded("delete", key, &e);
                Ok(false)
            }
        }
    }

    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        self.validate_key(key)?;
        match self.backend.exists(key).await {
            Ok(found) => Ok(found),
            Err(e) => {
                self.degraded("exists", key, &e);
                Ok(false)
            }
        }
    }

    /// Delete every key matching a glob pattern, returning the count removed
    pub async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        if pattern.is_empty() {
            return Err(CacheError::InvalidKey {
                message: "Invalidation pattern cannot be empty".to_string(),
            });
        }

        match self.backend.invalidate_pattern(pattern).await {
            Ok(removed) => {
                self.counters.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
                counter!("cache_layer_invalidated_keys_total").increment(removed as u64);
                debug!("Invalidated {} keys matching {}", removed, pattern);
                Ok(removed)
            }
            Err(e) if e.is_caller_error() => Err(e),
            Err(e) => {
                self.degraded("invalidate_pattern", pattern, &e);
                Ok(0)
            }
        }
    }

    /// Expand an invalidation event and run its patterns concurrently
    pub async fn invalidate(&self, event: InvalidationEvent) -> CacheResult<usize> {
        let patterns = event.patterns();
        let results = join_all(patterns.iter().map(|pattern| self.invalidate_pattern(pattern))).await;

        let mut removed = 0;
        for result in results {
            removed += result?;
        }

        info!("Invalidation '{}' removed {} keys", event.label(), removed);
        Ok(removed)
    }

    /// Return the cached value or fetch, store and return it
    ///
    /// With coalescing enabled concurrent misses for the same key share one
    /// `fetcher` invocation. A fetcher error reaches every waiter and nothing
    /// is stored.
    pub async fn get_or_set<T, F, Fut, E>(&self, key: &str, fetcher: F, ttl: Option<Duration>) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.get_or_set_traced(key, fetcher, ttl).await.map(|(value, _)| value)
    }

    /// [`get_or_set`](Self::get_or_set) that also reports whether the first lookup hit
    pub(crate) async fn get_or_set_traced<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Option<Duration>,
    ) -> CacheResult<(T, bool)>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok((value, true));
        }

        let ttl = ttl.unwrap_or(self.ttl.default);
        let backend = self.backend.clone();
        let counters = self.counters.clone();
        let owned_key = key.to_string();

        let load = async move {
            // Another caller may have stored the value since our miss
            if let Ok(Some(bytes)) = backend.get(&owned_key).await {
                if serde_json::from_slice::<T>(&bytes).is_ok() {
                    return Ok(Bytes::from(bytes));
                }
            }

            counters.fetches.fetch_add(1, Ordering::Relaxed);
            let value = fetcher().await.map_err(|e| CacheError::Fetch(Arc::new(e)))?;
            let bytes = serde_json::to_vec(&value)?;
            store_quietly(&backend, &counters, &owned_key, &bytes, ttl).await;
            Ok::<_, CacheError>(Bytes::from(bytes))
        };

        let bytes = match &self.coalescer {
            Some(coalescer) => coalescer
                .deduplicate(&format!("get_or_set:{}", key), move || async move {
                    load.await.map_err(Arc::new)
                })
                .await
                .map_err(unshare)?,
            None => load.await?,
        };

        Ok((serde_json::from_slice(&bytes)?, false))
    }

    /// Build a deterministic key from a prefix and unordered parameters
    pub fn generate_key<I, K, V>(&self, prefix: &str, params: I) -> String
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Display,
    {
        key_generator::generate_key(prefix, params)
    }

    pub async fn invalidate_inventory(&self) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::Inventory).await
    }

    pub async fn invalidate_invoices(&self) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::Invoices).await
    }

    pub async fn invalidate_reference_data(&self) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::ReferenceData).await
    }

    pub async fn invalidate_stats(&self) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::Stats).await
    }

    pub async fn invalidate_user_session(&self, user_id: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::UserSession {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn invalidate_user_permissions(&self, user_id: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::UserPermissions {
            user_id: user_id.to_string(),
        })
        .await
    }

    /// Also drops every cached user permission set
    pub async fn invalidate_role_permissions(&self, role_id: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::RolePermissions {
            role_id: role_id.to_string(),
        })
        .await
    }

    /// Session, permissions and token validations of one user
    pub async fn invalidate_user_auth(&self, user_id: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::UserAuth {
            user_id: user_id.to_string(),
        })
        .await
    }

    pub async fn invalidate_token(&self, token_id: &str) -> CacheResult<usize> {
        self.invalidate(InvalidationEvent::Token {
            token_id: token_id.to_string(),
        })
        .await
    }

    /// Remove every entry
    pub async fn clear(&self) -> CacheResult<()> {
        if let Err(e) = self.backend.clear().await {
            self.degraded("clear", "*", &e);
        }
        info!("Cache cleared");
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self.backend.health_check().await {
            Ok(healthy) => healthy,
            Err(e) => {
                warn!("Cache health check failed: {}", e);
                false
            }
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        ManagerStats {
            backend: self.backend.kind(),
            hits,
            misses,
            hit_rate: if lookups > 0 { hits as f64 / lookups as f64 } else { 0.0 },
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            degraded_operations: self.counters.degraded.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            store: self.backend.stats().await.unwrap_or_default(),
            coalescing: self.coalescer.as_ref().map(RequestDeduplicator::stats),
        }
    }

    /// Stop background tasks and release backend connections
    pub async fn shutdown(&self) {
        if let Some(coalescer) = &self.coalescer {
            coalescer.shutdown().await;
        }
        self.backend.shutdown().await;
        info!("Cache manager shut down");
    }

    async fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        match self.backend.get(key).await {
            Ok(Some(bytes)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!("cache_layer_cache_hits_total").increment(1);
                debug!("Cache hit for key: {}", key);
                Some(bytes)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                counter!("cache_layer_cache_misses_total").increment(1);
                debug!("Cache miss for key: {}", key);
                None
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.degraded("get", key, &e);
                None
            }
        }
    }

    fn degraded(&self, operation: &str, key: &str, error: &CacheError) {
        self.counters.degraded.fetch_add(1, Ordering::Relaxed);
        warn!("Cache {} failed for {}, continuing without cache: {}", operation, key, error);
    }

    /// Validate cache key
    pub(crate) fn validate_key(&self, key: &str) -> CacheResult<()> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey {
                message: "Cache key cannot be empty".to_string(),
            });
        }

        if key.len() > self.max_key_length {
            return Err(CacheError::InvalidKey {
                message: format!(
                    "Cache key length {} exceeds maximum {}",
                    key.len(),
                    self.max_key_length
                ),
            });
        }

        Ok(())
    }
}

async fn store_quietly(backend: &CacheBackend, counters: &Counters, key: &str, bytes: &[u8], ttl: Duration) {
    match backend.set(key, bytes, ttl).await {
        Ok(()) => {
            counters.sets.fetch_add(1, Ordering::Relaxed);
            debug!("Cached key: {} with TTL: {:?}", key, ttl);
        }
        Err(e) => {
            counters.degraded.fetch_add(1, Ordering::Relaxed);
            warn!("Cache set failed for {}, continuing without cache: {}", key, e);
        }
    }
}

/// Recover an owned error from a coalesced failure
fn unshare(error: Arc<CacheError>) -> CacheError {
    match Arc::try_unwrap(error) {
        Ok(error) => error,
        Err(shared) => match shared.as_ref() {
            CacheError::Fetch(source) => CacheError::Fetch(source.clone()),
            _ => CacheError::Fetch(shared),
        },
    }
}
