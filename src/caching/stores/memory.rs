//! # In-Memory Cache Store
//!
//! Bounded in-process cache with per-entry TTL, least-recently-accessed
//! eviction when full, and a background sweep that removes expired entries.
//!
//! The sweep snapshots expired keys first and then removes them one by one,
//! so no shard lock is held across the whole scan.

use super::{glob_to_regex, CacheEntry, CacheStore, CacheStoreStats};
use crate::caching::CacheResult;
use crate::core::config::task_period;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// In-memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryCacheConfig {
    /// Maximum number of entries
    pub max_entries: usize,

    /// Maximum memory usage in bytes
    pub max_memory_bytes: usize,

    /// Interval of the expired-entry sweep
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for InMemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10000,
            max_memory_bytes: 100 * 1024 * 1024, // 100MB
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Counters shared with the sweep task
#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
    memory_usage: AtomicUsize,
}

impl Counters {
    fn release(&self, bytes: usize) {
        // Saturating: concurrent replace/remove may briefly disagree with the map
        let _ = self
            .memory_usage
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(bytes))
            });
    }
}

/// In-memory cache implementation
pub struct InMemoryCache {
    /// Configuration
    config: InMemoryCacheConfig,

    /// Cache entries storage
    entries: Arc<DashMap<String, CacheEntry>>,

    counters: Arc<Counters>,

    /// Cancels the sweep task
    shutdown: CancellationToken,

    _cleanup_task: JoinHandle<()>,
}

impl InMemoryCache {
    /// Create a new in-memory cache and start its sweep task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: InMemoryCacheConfig) -> Self {
        let entries = Arc::new(DashMap::new());
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let cleanup_task = {
            let entries = entries.clone();
            let counters = counters.clone();
            let token = shutdown.clone();
            let period = task_period(
                "In-memory cache sweep",
                config.cleanup_interval,
                InMemoryCacheConfig::default().cleanup_interval,
            );

            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            Self::cleanup_expired_entries(&entries, &counters);
                        }
                    }
                }
                debug!("In-memory cache sweep stopped");
            })
        };

        info!(
            "In-memory cache initialized with max {} entries, sweep every {:?}",
            config.max_entries, config.cleanup_interval
        );

        Self {
            config,
            entries,
            counters,
            shutdown,
            _cleanup_task: cleanup_task,
        }
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run one sweep now; returns the number of entries removed
    pub fn sweep_expired(&self) -> usize {
        Self::cleanup_expired_entries(&self.entries, &self.counters)
    }

    /// Stop the sweep task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn cleanup_expired_entries(entries: &DashMap<String, CacheEntry>, counters: &Counters) -> usize {
        let now = Instant::now();

        let expired_keys: Vec<String> = entries
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleaned = 0;
        let mut freed = 0;
        for key in expired_keys {
            // Re-check: the key may have been written again since the snapshot
            if let Some((_, entry)) = entries.remove_if(&key, |_, entry| entry.is_expired_at(now)) {
                freed += entry.size();
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            counters.release(freed);
            counters.expired_cleanups.fetch_add(cleaned as u64, Ordering::Relaxed);
            debug!("Cleaned up {} expired cache entries, freed {} bytes", cleaned, freed);
        }
        cleaned
    }

    /// Make room for one more entry if the cache is at capacity
    fn evict_if_needed(&self, incoming_key: &str) {
        if self.entries.contains_key(incoming_key) {
            return;
        }

        let at_capacity = self.entries.len() >= self.config.max_entries
            || self.counters.memory_usage.load(Ordering::Relaxed) >= self.config.max_memory_bytes;
        if !at_capacity {
            return;
        }

        // Expired entries go first
        if self.sweep_expired() > 0 && self.entries.len() < self.config.max_entries {
            return;
        }

        let mut by_access: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_accessed))
            .collect();
        by_access.sort_by_key(|(_, accessed)| *accessed);

        // Keep 90% of max entries, evict at least one
        let target = self.config.max_entries * 9 / 10;
        let evict_count = std::cmp::max(by_access.len().saturating_sub(target), 1);

        let mut evicted = 0u64;
        let mut freed = 0;
        for (key, _) in by_access.into_iter().take(evict_count) {
            if let Some((_, entry)) = self.entries.remove(&key) {
                freed += entry.size();
                evicted += 1;
            }
        }

        self.counters.release(freed);
        self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!("Evicted {} least recently used cache entries, freed {} bytes", evicted, freed);
    }
}

impl Drop for InMemoryCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_expired() {
                drop(entry);
                if let Some((_, expired)) = self.entries.remove_if(key, |_, e| e.is_expired()) {
                    self.counters.release(expired.size());
                    self.counters.expired_cleanups.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }

            entry.mark_accessed();
            let value = entry.value.clone();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(value))
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.evict_if_needed(key);

        let entry = CacheEntry::new(value.to_vec(), ttl);
        let entry_size = entry.size();

        if let Some(old_entry) = self.entries.insert(key.to_string(), entry) {
            self.counters.release(old_entry.size());
        }
        self.counters.memory_usage.fetch_add(entry_size, Ordering::Relaxed);

        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.counters.release(entry.size());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn invalidate_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let matcher = glob_to_regex(pattern)?;

        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| matcher.is_match(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in matching {
            if let Some((_, entry)) = self.entries.remove(&key) {
                self.counters.release(entry.size());
                removed += 1;
            }
        }

        debug!("Invalidated {} in-memory keys matching pattern: {}", removed, pattern);
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self
            .entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false))
    }

    async fn clear(&self) -> CacheResult<()> {
        let entry_count = self.entries.len();
        self.entries.clear();
        self.counters.memory_usage.store(0, Ordering::Relaxed);

        info!("Cleared {} entries from in-memory cache", entry_count);
        Ok(())
    }

    async fn stats(&self) -> CacheResult<CacheStoreStats> {
        Ok(CacheStoreStats {
            entries: self.entries.len(),
            memory_usage: self.counters.memory_usage.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.counters.expired_cleanups.load(Ordering::Relaxed),
            connected: true,
        })
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(!self.shutdown.is_cancelled())
    }
}
