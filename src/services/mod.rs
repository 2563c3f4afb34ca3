//! # Domain Cache Services
//!
//! Inventory and transfer caches built on the [`CacheManager`]. Each service
//! derives keys from filter objects, records hit/miss metrics per key prefix,
//! expands entity changes into the invalidation patterns they affect, and
//! periodically warms popular filter combinations.
//!
//! Data is kept opaque (`serde_json::Value`): the services only decide what
//! is cached, under which key, and for how long. The data itself comes from
//! the loaders the application supplies.

pub mod inventory;
pub mod metrics;
pub mod transfer;
pub mod warming;

pub use inventory::{InventoryCacheService, InventoryChange, InventoryFilters, InventoryLoader};
pub use metrics::{CacheMetrics, MetricsRegistry};
pub use transfer::{TransferCacheService, TransferChange, TransferFilters, TransferLoader};
pub use warming::{Warmable, WarmingConfig, WarmingOutcome, WarmingTask};

use crate::caching::key_generator::key_segment;
use crate::caching::{CacheError, CacheManager};
use crate::core::error::{LayerError, LayerResult};
use crate::observability::performance::{Metadata, PerformanceMonitor};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Inclusive date range filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Analytics provider for predictive warming
///
/// Either list may come back empty, in which case the service falls back to
/// its built-in defaults.
#[async_trait]
pub trait PopularFilterSource: Send + Sync + 'static {
    async fn popular_inventory_filters(&self) -> LayerResult<Vec<InventoryFilters>> {
        Ok(Vec::new())
    }

    async fn popular_transfer_filters(&self) -> LayerResult<Vec<TransferFilters>> {
        Ok(Vec::new())
    }
}

/// Key scope for shop-filtered data
pub(crate) fn shop_scope(shop_id: Option<u64>) -> String {
    match shop_id {
        Some(id) => format!("shop-{}", id),
        None => "all".to_string(),
    }
}

/// Cache access shared by the domain services
pub(crate) struct DomainCache {
    service: &'static str,
    cache: Arc<CacheManager>,
    monitor: Arc<PerformanceMonitor>,
    metrics: MetricsRegistry,
}

impl DomainCache {
    pub(crate) fn new(service: &'static str, cache: Arc<CacheManager>, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            service,
            cache,
            monitor,
            metrics: MetricsRegistry::new(service),
        }
    }

    pub(crate) fn manager(&self) -> &CacheManager {
        &self.cache
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Cache-aside read with metrics; concurrent misses share one load
    pub(crate) async fn read<F, Fut>(&self, key: &str, ttl: Duration, load: F) -> LayerResult<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = LayerResult<Value>> + Send + 'static,
    {
        let prefix = key_segment(key);
        let started = Instant::now();

        if let Err(e) = self.cache.validate_key(key) {
            // Unusable key: serve straight from the loader
            warn!("{} cache bypassed for {}: {}", self.service, key, e);
            let result = load().await;
            self.finish(prefix, key, started, false);
            return result;
        }

        match self.cache.get_or_set_traced(key, load, Some(ttl)).await {
            Ok((value, hit)) => {
                self.finish(prefix, key, started, hit);
                Ok(value)
            }
            Err(e) => {
                self.finish(prefix, key, started, false);
                Err(loader_failure(e))
            }
        }
    }

    /// Populate `key` if absent; failures are logged and counted
    pub(crate) async fn warm_key<F, Fut>(&self, key: &str, ttl: Duration, load: F) -> warming::WarmingOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LayerResult<Value>>,
    {
        let mut outcome = warming::WarmingOutcome {
            attempted: 1,
            ..Default::default()
        };

        if matches!(self.cache.exists(key).await, Ok(true)) {
            debug!("Warming skipped {}, already cached", key);
            return outcome;
        }

        match load().await {
            Ok(value) => match self.cache.set(key, &value, Some(ttl)).await {
                Ok(()) => outcome.populated = 1,
                Err(e) => {
                    warn!("Warming could not store {}: {}", key, e);
                    outcome.failed = 1;
                }
            },
            Err(e) => {
                warn!("Warming loader failed for {}: {}", key, e);
                outcome.failed = 1;
            }
        }
        outcome
    }

    /// Run invalidation patterns concurrently and return the keys removed
    pub(crate) async fn invalidate_patterns(&self, patterns: &[String]) -> usize {
        let results = join_all(patterns.iter().map(|p| self.cache.invalidate_pattern(p))).await;

        results
            .into_iter()
            .zip(patterns)
            .map(|(result, pattern)| match result {
                Ok(removed) => removed,
                Err(e) => {
                    warn!("{} invalidation of {} failed: {}", self.service, pattern, e);
                    0
                }
            })
            .sum()
    }

    fn finish(&self, prefix: &str, key: &str, started: Instant, hit: bool) {
        let elapsed = started.elapsed();
        if hit {
            self.metrics.record_hit(prefix, elapsed);
            debug!("{} cache hit: {}", self.service, key);
        } else {
            self.metrics.record_miss(prefix, elapsed);
            debug!("{} cache miss: {}", self.service, key);
        }

        let mut metadata = Metadata::new();
        metadata.insert("hit".to_string(), Value::Bool(hit));
        self.monitor.record(&format!("{}.read", prefix), elapsed, metadata);
    }
}

/// Recover the loader's own error from a failed fetch-on-miss
fn loader_failure(error: CacheError) -> LayerError {
    if let CacheError::Fetch(source) = &error {
        if let Some(LayerError::Loader { source_name, message }) = source.downcast_ref::<LayerError>() {
            return LayerError::loader(source_name.clone(), message.clone());
        }
    }
    LayerError::Cache(error)
}
