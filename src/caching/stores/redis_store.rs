//! # Redis Cache Store
//!
//! Network cache backed by Redis. The connection is established lazily on
//! first use with a bounded timeout. While the store is disconnected every
//! operation degrades to a miss or a no-op: callers never see a cache outage
//! as a request failure.
//!
//! A failed command drops the connection and starts a back-off window; the
//! first operation after the window tries to connect again. The
//! healthy → disconnected transition is logged once per occurrence.

use super::{escape_redis_glob, CacheStore, CacheStoreStats, MAX_TTL};
use crate::caching::{CacheError, CacheResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Redis cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// Redis connection URL; `None` keeps the store permanently disconnected
    pub url: Option<String>,

    /// Upper bound for establishing a connection
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Upper bound for a single command
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Wait after a failure before trying to connect again
    #[serde(with = "humantime_serde")]
    pub reconnect_backoff: Duration,

    /// Key prefix for all cache entries
    pub key_prefix: String,

    /// `COUNT` hint for SCAN during pattern invalidation
    pub scan_count: usize,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            connection_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_secs(5),
            key_prefix: "retail:cache:".to_string(),
            scan_count: 1000,
        }
    }
}

/// Redis cache implementation
pub struct RedisCache {
    /// Configuration
    config: RedisCacheConfig,

    /// Parsed client, absent when no URL is configured
    client: Option<Client>,

    /// Live connection, if any
    connection: RwLock<Option<ConnectionManager>>,

    /// Set while the store is in a failure episode
    degraded: AtomicBool,

    /// When the last connection attempt or command failed
    last_failure: Mutex<Option<Instant>>,

    /// Statistics counters
    hits: AtomicU64,
    misses: AtomicU64,
    connection_errors: AtomicU64,
    timeouts: AtomicU64,
}

impl RedisCache {
    /// Create a new Redis cache; no connection is made until first use
    pub fn new(config: RedisCacheConfig) -> CacheResult<Self> {
        let client = match config.url.as_deref() {
            Some(url) if !url.is_empty() => Some(Client::open(url).map_err(CacheError::Redis)?),
            _ => None,
        };

        if client.is_none() {
            warn!("Redis cache created without a URL; all operations will miss");
        }

        Ok(Self {
            config,
            client,
            connection: RwLock::new(None),
            degraded: AtomicBool::new(false),
            last_failure: Mutex::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        })
    }

    /// Get the full cache key with prefix
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// `SCAN MATCH` argument for a glob where only `*` is a wildcard
    fn match_pattern(&self, pattern: &str) -> String {
        format!(
            "{}{}",
            escape_redis_glob(&self.config.key_prefix, false),
            escape_redis_glob(pattern, true)
        )
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Drop the connection; the next operation reconnects lazily
    pub async fn disconnect(&self) {
        if self.connection.write().await.take().is_some() {
            info!("Redis cache connection released");
        }
    }

    /// Current connection, connecting lazily when allowed
    async fn connection(&self) -> Option<ConnectionManager> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            return Some(conn.clone());
        }

        let client = self.client.as_ref()?;

        if let Some(failed_at) = *self.last_failure.lock() {
            if failed_at.elapsed() < self.config.reconnect_backoff {
                return None;
            }
        }

        // Another task is already connecting; treat this call as a miss instead of waiting
        let mut slot = self.connection.try_write().ok()?;
        if let Some(conn) = slot.as_ref() {
            return Some(conn.clone());
        }

        match timeout(self.config.connection_timeout, ConnectionManager::new(client.clone())).await {
            Ok(Ok(conn)) => {
                *slot = Some(conn.clone());
                *self.last_failure.lock() = None;
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!("Redis cache connection restored");
                } else {
                    info!("Redis cache connected");
                }
                Some(conn)
            }
            Ok(Err(e)) => {
                drop(slot);
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                self.mark_failed(&format!("connect failed: {}", e)).await;
                None
            }
            Err(_) => {
                drop(slot);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.mark_failed(&format!(
                    "connect timed out after {:?}",
                    self.config.connection_timeout
                ))
                .await;
                None
            }
        }
    }

    async fn mark_failed(&self, reason: &str) {
        *self.last_failure.lock() = Some(Instant::now());
        if let Ok(mut slot) = self.connection.try_write() {
            slot.take();
        }
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Redis cache unavailable, serving misses: {}", reason);
        } else {
            debug!("Redis cache still unavailable: {}", reason);
        }
    }

    /// Run a command against the live connection; `None` means the store is unavailable
    async fn run<T, F, Fut>(&self, operation: &str, command: F) -> Option<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;

        match timeout(self.config.operation_timeout, command(conn)).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.connection_errors.fetch_add(1, Ordering::Relaxed);
                self.mark_failed(&format!("{} failed: {}", operation, e)).await;
                None
            }
            Err(_) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                self.mark_failed(&format!("{} timed out", operation)).await;
                None
            }
        }
    }

    /// Keys (with prefix) matching a glob, enumerated with SCAN
    async fn scan_keys(&self, full_pattern: String) -> Option<Vec<String>> {
        let count = self.config.scan_count;
        self.run("SCAN", |mut conn| async move {
            let mut cursor: u64 = 0;
            let mut all_keys = Vec::new();

            loop {
                let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&full_pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await?;

                all_keys.extend(keys);

                if next_cursor == 0 {
                    break;
                }
                cursor = next_cursor;
            }

            Ok::<Vec<String>, redis::RedisError>(all_keys)
        })
        .await
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let full_key = self.full_key(key);

        let value = self
            .run("GET", |mut conn| async move {
                conn.get::<_, Option<Vec<u8>>>(&full_key).await
            })
            .await
            .flatten();

        match value {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache hit for key: {}", key);
                Ok(Some(value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Redis cache miss for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let full_key = self.full_key(key);
        let ttl_millis = u64::try_from(ttl.min(MAX_TTL).as_millis()).unwrap_or(u64::MAX).max(1);
        let value = value.to_vec();

        let stored = self
            .run("SET", |mut conn| async move {
                redis::cmd("SET")
                    .arg(&full_key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl_millis)
                    .query_async::<_, ()>(&mut conn)
                    .await
            })
            .await;

        if stored.is_some() {
            debug!("Set Redis cache key: {} with TTL: {:?}", key, ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);

        let deleted = self
            .run("DEL", |mut conn| async move { conn.del::<_, usize>(&full_key).await })
            .await
            .unwrap_or(0);

        Ok(deleted > 0)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let Some(keys) = self.scan_keys(self.match_pattern(pattern)).await else {
            return Ok(0);
        };

        if keys.is_empty() {
            return Ok(0);
        }

        let deleted = self
            .run("DEL", |mut conn| async move { conn.del::<_, usize>(&keys).await })
            .await
            .unwrap_or(0);

        debug!("Invalidated {} Redis keys matching pattern: {}", deleted, pattern);
        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let full_key = self.full_key(key);

        Ok(self
            .run("EXISTS", |mut conn| async move { conn.exists::<_, bool>(&full_key).await })
            .await
            .unwrap_or(false))
    }

    async fn clear(&self) -> CacheResult<()> {
        let removed = self.invalidate_pattern("*").await?;
        info!("Cleared {} keys from Redis cache", removed);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        let connected = self.is_connected().await;
        let entries = if connected {
            self.scan_keys(self.match_pattern("*"))
                .await
                .map(|keys| keys.len())
                .unwrap_or(0)
        } else {
            0
        };

        Ok(CacheStoreStats {
            entries,
            memory_usage: 0,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,        // Redis handles eviction internally
            expired_cleanups: 0, // Redis handles TTL cleanup internally
            connected,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let response = self
            .run("PING", |mut conn| async move {
                redis::cmd("PING").query_async::<_, String>(&mut conn).await
            })
            .await;

        Ok(matches!(response.as_deref(), Some("PONG")))
    }
}
