//! # Request Deduplication Module
//!
//! Collapses concurrent identical operations into one shared in-flight
//! future. The first caller for a key registers the operation; every caller
//! that arrives while it is still running awaits the same
//! [`futures::future::Shared`] instead of invoking its own copy. The entry is
//! removed the moment the operation settles, so a later call runs the
//! operation again: nothing is cached here.
//!
//! Bounding:
//! - at most `max_concurrent` keys are tracked; past that ceiling stale
//!   entries are swept and, if the map is still full, the call bypasses
//!   deduplication and runs directly
//! - a periodic sweep drops entries not accessed within `max_age`
//!
//! Cancellation: each caller can stop waiting (drop its future or use
//! [`RequestDeduplicator::deduplicate_with_timeout`]) without affecting the
//! other waiters. When the last waiter leaves before the operation settles
//! the entry is removed and the operation is dropped.

use crate::core::config::task_period;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Deduplication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeduplicationConfig {
    /// Enable request deduplication
    pub enabled: bool,

    /// Entries older than this are neither joined nor kept
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Ceiling on tracked in-flight keys
    pub max_concurrent: usize,

    /// Interval of the stale-entry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_age: Duration::from_secs(30),
            max_concurrent: 100,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Deduplication errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeduplicationError {
    /// This caller stopped waiting; the shared operation keeps running for others
    #[error("Timed out after {waited:?} waiting for in-flight request {key}")]
    Timeout { key: String, waited: Duration },
}

/// Deduplication statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeduplicationStats {
    /// Keys currently in flight
    pub in_flight: usize,

    /// Operations actually started
    pub executed: u64,

    /// Callers that joined an existing operation
    pub coalesced: u64,

    /// Callers that ran directly because the ceiling was reached
    pub bypassed: u64,

    /// Entries removed by the stale sweep
    pub evicted: u64,

    /// Entries removed because every waiter went away
    pub abandoned: u64,
}

type SharedCall<T> = Shared<BoxFuture<'static, T>>;

/// In-flight request tracking
struct InFlightRequest<T: Clone> {
    id: u64,
    future: SharedCall<T>,
    first_seen_at: Instant,
    last_access_at: Instant,
    waiters: usize,
}

impl<T: Clone> InFlightRequest<T> {
    fn joinable(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.first_seen_at) < max_age
    }

    fn idle_too_long(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.last_access_at) >= max_age
    }
}

struct Inner<T: Clone> {
    config: DeduplicationConfig,
    in_flight: DashMap<String, InFlightRequest<T>>,
    next_id: AtomicU64,
    executed: AtomicU64,
    coalesced: AtomicU64,
    bypassed: AtomicU64,
    evicted: AtomicU64,
    abandoned: AtomicU64,
}

impl<T: Clone> Inner<T> {
    /// Snapshot idle keys, then remove those still idle
    fn evict_stale(&self, now: Instant) -> usize {
        let max_age = self.config.max_age;
        let stale: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.value().idle_too_long(now, max_age))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in stale {
            if self
                .in_flight
                .remove_if(&key, |_, entry| entry.idle_too_long(now, max_age))
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            info!("Evicted {} stale in-flight request entries", removed);
        }
        removed
    }
}

/// Shares in-flight operations between concurrent callers with the same key
///
/// `T` is the settled output handed to every waiter, typically a
/// `Result<_, _>` whose error type is cheap to clone.
pub struct RequestDeduplicator<T: Clone + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
    shutdown: CancellationToken,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> RequestDeduplicator<T> {
    /// Create a deduplicator and start its sweep task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: DeduplicationConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            in_flight: DashMap::new(),
            next_id: AtomicU64::new(1),
            executed: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let sweep_task = {
            let inner = inner.clone();
            let token = shutdown.clone();
            let period = task_period(
                "Deduplication sweep",
                inner.config.sweep_interval,
                DeduplicationConfig::default().sweep_interval,
            );

            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            inner.evict_stale(Instant::now());
                        }
                    }
                }
                debug!("Deduplication sweep stopped");
            })
        };

        Self {
            inner,
            shutdown,
            sweep_task: Mutex::new(Some(sweep_task)),
        }
    }

    /// Run `call` unless an identical operation is already in flight, in
    /// which case wait for that one instead
    ///
    /// `call` is only invoked by the caller that registers the operation (or
    /// by a bypassing caller); it runs on the first poll, never while the
    /// in-flight map is locked.
    pub async fn deduplicate<F, Fut>(&self, key: &str, call: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        if !self.inner.config.enabled || self.shutdown.is_cancelled() {
            return call().await;
        }

        let max_age = self.inner.config.max_age;
        let now = Instant::now();

        if let Some((id, shared)) = self.join_existing(key, now) {
            return self.wait(key, id, shared).await;
        }

        if self.inner.in_flight.len() >= self.inner.config.max_concurrent {
            self.inner.evict_stale(now);
            if self.inner.in_flight.len() >= self.inner.config.max_concurrent {
                self.inner.bypassed.fetch_add(1, Ordering::Relaxed);
                counter!("cache_layer_dedup_bypassed_total").increment(1);
                warn!(
                    "Deduplication ceiling of {} in-flight requests reached, running {} directly",
                    self.inner.config.max_concurrent, key
                );
                return call().await;
            }
        }

        let (id, shared) = match self.inner.in_flight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().joinable(now, max_age) => {
                // Lost the race to another caller registering the same key
                let entry = occupied.get_mut();
                entry.waiters += 1;
                entry.last_access_at = now;
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                (entry.id, entry.future.clone())
            }
            Entry::Occupied(mut occupied) => {
                let request = self.register(key, now, call);
                let handle = (request.id, request.future.clone());
                occupied.insert(request);
                handle
            }
            Entry::Vacant(vacant) => {
                let request = self.register(key, now, call);
                let handle = (request.id, request.future.clone());
                vacant.insert(request);
                handle
            }
        };

        self.wait(key, id, shared).await
    }

    /// Like [`deduplicate`](Self::deduplicate) but stop waiting after `wait`
    ///
    /// Timing out only affects this caller; other waiters keep the shared
    /// operation alive.
    pub async fn deduplicate_with_timeout<F, Fut>(
        &self,
        key: &str,
        wait: Duration,
        call: F,
    ) -> Result<T, DeduplicationError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        tokio::time::timeout(wait, self.deduplicate(key, call))
            .await
            .map_err(|_| DeduplicationError::Timeout {
                key: key.to_string(),
                waited: wait,
            })
    }

    /// Number of keys currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Whether an operation for `key` is currently in flight
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    /// Run the stale-entry sweep now
    pub fn evict_stale(&self) -> usize {
        self.inner.evict_stale(Instant::now())
    }

    pub fn stats(&self) -> DeduplicationStats {
        DeduplicationStats {
            in_flight: self.inner.in_flight.len(),
            executed: self.inner.executed.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            bypassed: self.inner.bypassed.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            abandoned: self.inner.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Stop the sweep task and forget all tracked entries
    ///
    /// Callers already waiting keep their handle on the shared operation.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.in_flight.clear();
        info!("Request deduplicator shut down");
    }

    fn join_existing(&self, key: &str, now: Instant) -> Option<(u64, SharedCall<T>)> {
        let mut entry = self.inner.in_flight.get_mut(key)?;
        if !entry.joinable(now, self.inner.config.max_age) {
            return None;
        }
        entry.waiters += 1;
        entry.last_access_at = now;
        self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
        counter!("cache_layer_dedup_coalesced_total").increment(1);
        debug!("Joining in-flight request {} ({} waiters)", key, entry.waiters);
        Some((entry.id, entry.future.clone()))
    }

    fn register<F, Fut>(&self, key: &str, now: Instant, call: F) -> InFlightRequest<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();

        let future = async move {
            let output = call().await;
            // Settled: the next caller for this key starts a fresh operation
            if let Some(inner) = registry.upgrade() {
                inner.in_flight.remove_if(&owned_key, |_, entry| entry.id == id);
            }
            output
        }
        .boxed()
        .shared();

        self.inner.executed.fetch_add(1, Ordering::Relaxed);
        debug!("Registered in-flight request {}", key);

        InFlightRequest {
            id,
            future,
            first_seen_at: now,
            last_access_at: now,
            waiters: 1,
        }
    }

    async fn wait(&self, key: &str, id: u64, shared: SharedCall<T>) -> T {
        let mut guard = WaiterGuard {
            inner: &self.inner,
            key,
            id,
            settled: false,
        };
        let output = shared.await;
        guard.settled = true;
        output
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for RequestDeduplicator<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Releases a waiter slot when a caller stops waiting early
struct WaiterGuard<'a, T: Clone> {
    inner: &'a Inner<T>,
    key: &'a str,
    id: u64,
    settled: bool,
}

impl<T: Clone> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let abandoned = self
            .inner
            .in_flight
            .remove_if_mut(self.key, |_, entry| {
                if entry.id != self.id {
                    return false;
                }
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.waiters == 0
            })
            .is_some();

        if abandoned {
            self.inner.abandoned.fetch_add(1, Ordering::Relaxed);
            debug!("Last waiter left in-flight request {}, dropping it", self.key);
        }
    }
}

/// Deterministic key for an outbound HTTP request
///
/// Method, lower-cased URL, body, and the sorted headers other than
/// `Authorization` are hashed into `dedup:<sha256 hex>`.
pub fn request_key<I, K, V>(method: &str, url: &str, body: Option<&[u8]>, headers: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut header_pairs: Vec<(String, String)> = headers
        .into_iter()
        .filter(|(name, _)| !name.as_ref().eq_ignore_ascii_case("authorization"))
        .map(|(name, value)| (name.as_ref().to_ascii_lowercase(), value.as_ref().trim().to_string()))
        .collect();
    header_pairs.sort();

    let mut hasher = Sha256::new();
    hasher.update(method.trim().to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.trim().to_lowercase().as_bytes());
    hasher.update(b"\n");
    if let Some(body) = body {
        hasher.update(body);
    }
    hasher.update(b"\n");
    for (name, value) in &header_pairs {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }

    format!("dedup:{}", hex::encode(hasher.finalize()))
}
