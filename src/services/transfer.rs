//! # Transfer Cache Service
//!
//! Caches stock transfers between shops under `transfers:list|detail|summary|analytics`.
//! A transfer moves stock, so its invalidation also covers the inventory
//! aggregates of both shops involved.

use super::inventory::{inventory_patterns, InventoryChange};
use super::warming::{Warmable, WarmingConfig, WarmingOutcome, WarmingTask};
use super::{shop_scope, CacheMetrics, DateRange, DomainCache, PopularFilterSource};
use crate::caching::key_generator::FilterKeyBuilder;
use crate::caching::CacheManager;
use crate::core::config::{CacheCategory, CacheLayerConfig};
use crate::core::error::LayerResult;
use crate::observability::performance::PerformanceMonitor;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const POPULAR_FILTERS_KEY: &str = "transfers:popular-filters";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferFilters {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub status: Option<String>,
    /// Shop on either side of the transfer
    pub shop_id: Option<u64>,
    pub from_shop_id: Option<u64>,
    pub to_shop_id: Option<u64>,
    pub date_range: Option<DateRange>,
}

impl TransferFilters {
    pub fn page(page: u32, limit: u32) -> Self {
        Self {
            page: Some(page),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn cache_key(&self) -> String {
        FilterKeyBuilder::new("transfers:list", &shop_scope(self.shop_id))
            .field("page", self.page)
            .field("limit", self.limit)
            .text("search", self.search.as_deref())
            .text("status", self.status.as_deref())
            .field("from_shop", self.from_shop_id)
            .field("to_shop", self.to_shop_id)
            .field("from", self.date_range.map(|r| r.from))
            .field("to", self.date_range.map(|r| r.to))
            .build()
    }
}

/// A created, updated or completed transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferChange {
    pub transfer_id: Option<u64>,
    pub from_shop_id: Option<u64>,
    pub to_shop_id: Option<u64>,
}

impl TransferChange {
    fn shops(&self) -> Vec<u64> {
        let mut shops: Vec<u64> = self.from_shop_id.into_iter().chain(self.to_shop_id).collect();
        shops.dedup();
        shops
    }
}

/// Transfer and inventory patterns affected by a transfer change
pub fn transfer_patterns(change: &TransferChange) -> Vec<String> {
    let mut patterns = BTreeSet::new();
    let shops = change.shops();

    if let Some(transfer_id) = change.transfer_id {
        patterns.insert(format!("transfers:detail:{}", transfer_id));
    }

    if shops.is_empty() {
        for kind in ["list", "summary", "analytics"] {
            patterns.insert(format!("transfers:{}:*", kind));
        }
    } else {
        for kind in ["list", "summary", "analytics"] {
            patterns.insert(format!("transfers:{}:all|*", kind));
            for shop in &shops {
                patterns.insert(format!("transfers:{}:{}|*", kind, shop_scope(Some(*shop))));
            }
        }
        // Lists scoped to all shops but filtered by one side
        for shop in &shops {
            patterns.insert(format!("transfers:list:*|from_shop:{}|*", shop));
            patterns.insert(format!("transfers:list:*|to_shop:{}|*", shop));
        }

        patterns.extend(inventory_patterns(&InventoryChange {
            shop_ids: shops,
            ..Default::default()
        }));
    }

    patterns.into_iter().collect()
}

/// Transfer data source consulted on a miss
#[async_trait]
pub trait TransferLoader: Send + Sync + 'static {
    async fn load_list(&self, filters: &TransferFilters) -> LayerResult<Value>;

    async fn load_detail(&self, transfer_id: u64) -> LayerResult<Value>;

    async fn load_summary(&self, shop_id: Option<u64>) -> LayerResult<Value>;

    async fn load_analytics(&self, shop_id: Option<u64>, range: Option<DateRange>) -> LayerResult<Value>;
}

pub struct TransferCacheService {
    domain: DomainCache,
    loader: Arc<dyn TransferLoader>,
    popular: Option<Arc<dyn PopularFilterSource>>,
    warming_config: WarmingConfig,
    warming: Mutex<Option<WarmingTask>>,
}

impl TransferCacheService {
    pub fn new(
        cache: Arc<CacheManager>,
        monitor: Arc<PerformanceMonitor>,
        loader: Arc<dyn TransferLoader>,
        popular: Option<Arc<dyn PopularFilterSource>>,
        config: &CacheLayerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain: DomainCache::new("transfers", cache, monitor),
            loader,
            popular,
            warming_config: config.warming.clone(),
            warming: Mutex::new(None),
        })
    }

    pub fn start_warming(self: &Arc<Self>) {
        let mut warming = self.warming.lock();
        if warming.is_none() {
            *warming = WarmingTask::spawn(self, &self.warming_config);
        }
    }

    pub async fn list(&self, filters: &TransferFilters) -> LayerResult<Value> {
        let loader = self.loader.clone();
        let owned = filters.clone();
        self.domain
            .read(&filters.cache_key(), self.ttl(), move || async move {
                loader.load_list(&owned).await
            })
            .await
    }

    pub async fn detail(&self, transfer_id: u64) -> LayerResult<Value> {
        let loader = self.loader.clone();
        self.domain
            .read(&format!("transfers:detail:{}", transfer_id), self.ttl(), move || async move {
                loader.load_detail(transfer_id).await
            })
            .await
    }

    pub async fn summary(&self, shop_id: Option<u64>) -> LayerResult<Value> {
        let loader = self.loader.clone();
        let key = FilterKeyBuilder::new("transfers:summary", &shop_scope(shop_id)).build();
        self.domain
            .read(&key, self.ttl(), move || async move { loader.load_summary(shop_id).await })
            .await
    }

    pub async fn analytics(&self, shop_id: Option<u64>, range: Option<DateRange>) -> LayerResult<Value> {
        let loader = self.loader.clone();
        let key = FilterKeyBuilder::new("transfers:analytics", &shop_scope(shop_id))
            .field("from", range.map(|r| r.from))
            .field("to", range.map(|r| r.to))
            .build();
        let ttl = self.domain.manager().ttl_for(CacheCategory::Analytics);
        self.domain
            .read(&key, ttl, move || async move { loader.load_analytics(shop_id, range).await })
            .await
    }

    pub async fn invalidate(&self, change: &TransferChange) -> usize {
        let patterns = transfer_patterns(change);
        let removed = self.domain.invalidate_patterns(&patterns).await;
        info!(
            transfer = ?change.transfer_id,
            from_shop = ?change.from_shop_id,
            to_shop = ?change.to_shop_id,
            "Transfer invalidation removed {} keys",
            removed
        );
        removed
    }

    pub async fn popular_filters(&self) -> Vec<TransferFilters> {
        let manager = self.domain.manager();
        if let Ok(Some(cached)) = manager.get::<Vec<TransferFilters>>(POPULAR_FILTERS_KEY).await {
            if !cached.is_empty() {
                return cached;
            }
        }

        let discovered = match &self.popular {
            Some(source) => source.popular_transfer_filters().await.unwrap_or_else(|e| {
                warn!("Popular transfer filter discovery failed: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        if discovered.is_empty() {
            return default_filters();
        }

        let ttl = manager.ttl_for(CacheCategory::PopularFilters);
        if let Err(e) = manager.set(POPULAR_FILTERS_KEY, &discovered, Some(ttl)).await {
            warn!("Could not cache popular transfer filters: {}", e);
        }
        discovered
    }

    pub fn metrics(&self) -> HashMap<String, CacheMetrics> {
        self.domain.metrics().snapshot()
    }

    pub fn reset_metrics(&self) {
        self.domain.metrics().reset();
    }

    pub async fn shutdown(&self) {
        let task = self.warming.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
    }

    fn ttl(&self) -> Duration {
        self.domain.manager().ttl_for(CacheCategory::Transfers)
    }
}

fn default_filters() -> Vec<TransferFilters> {
    vec![
        TransferFilters::page(1, 20),
        TransferFilters {
            status: Some("pending".to_string()),
            ..TransferFilters::page(1, 20)
        },
    ]
}

#[async_trait]
impl Warmable for TransferCacheService {
    fn warming_name(&self) -> &'static str {
        "transfers"
    }

    async fn warm(&self) -> WarmingOutcome {
        let mut outcome = WarmingOutcome::default();
        for filters in self.popular_filters().await {
            let loader = &self.loader;
            outcome.merge(
                self.domain
                    .warm_key(&filters.cache_key(), self.ttl(), || loader.load_list(&filters))
                    .await,
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::stores::glob_to_regex;
    use crate::observability::performance::PerformanceConfig;
    use crate::services::inventory::InventoryFilters;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeLoader {
        list_calls: AtomicUsize,
        detail_calls: AtomicUsize,
    }

    #[async_trait]
    impl TransferLoader for FakeLoader {
        async fn load_list(&self, filters: &TransferFilters) -> LayerResult<Value> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "status": filters.status, "items": [] }))
        }

        async fn load_detail(&self, transfer_id: u64) -> LayerResult<Value> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "id": transfer_id, "status": "pending" }))
        }

        async fn load_summary(&self, shop_id: Option<u64>) -> LayerResult<Value> {
            Ok(json!({ "shop": shop_id, "pending": 2 }))
        }

        async fn load_analytics(&self, _shop_id: Option<u64>, _range: Option<DateRange>) -> LayerResult<Value> {
            Ok(json!({}))
        }
    }

    async fn service() -> (Arc<TransferCacheService>, Arc<FakeLoader>, Arc<CacheManager>) {
        let config = CacheLayerConfig::default();
        let cache = Arc::new(CacheManager::new(config.clone()).await.unwrap());
        let monitor = Arc::new(PerformanceMonitor::new(PerformanceConfig::default()));
        let loader = Arc::new(FakeLoader::default());
        let service = TransferCacheService::new(cache.clone(), monitor, loader.clone(), None, &config);
        (service, loader, cache)
    }

    fn any_match(patterns: &[String], key: &str) -> bool {
        patterns.iter().any(|p| glob_to_regex(p).unwrap().is_match(key))
    }

    #[test]
    fn test_patterns_cover_both_shops_and_inventory() {
        let patterns = transfer_patterns(&TransferChange {
            transfer_id: Some(5),
            from_shop_id: Some(1),
            to_shop_id: Some(2),
        });

        assert!(any_match(&patterns, "transfers:detail:5"));
        assert!(!any_match(&patterns, "transfers:detail:50"));
        assert!(any_match(&patterns, &TransferFilters { shop_id: Some(2), ..TransferFilters::page(1, 20) }.cache_key()));
        assert!(any_match(&patterns, &TransferFilters { from_shop_id: Some(1), ..Default::default() }.cache_key()));
        assert!(!any_match(&patterns, &TransferFilters { shop_id: Some(3), ..TransferFilters::page(1, 20) }.cache_key()));

        let inventory_key = InventoryFilters {
            shop_id: Some(1),
            ..InventoryFilters::page(1, 20)
        }
        .cache_key();
        assert!(any_match(&patterns, &inventory_key));
        assert!(any_match(&patterns, "inventory:summary:shop-2|"));
        assert!(!any_match(&patterns, "inventory:summary:shop-3|"));
    }

    #[tokio::test]
    async fn test_detail_cached_and_invalidated() {
        let (service, loader, _) = service().await;

        service.detail(5).await.unwrap();
        service.detail(5).await.unwrap();
        assert_eq!(loader.detail_calls.load(Ordering::SeqCst), 1);

        service
            .invalidate(&TransferChange {
                transfer_id: Some(5),
                from_shop_id: Some(1),
                to_shop_id: Some(2),
            })
            .await;
        service.detail(5).await.unwrap();
        assert_eq!(loader.detail_calls.load(Ordering::SeqCst), 2);

        let metrics = service.metrics();
        assert_eq!(metrics["transfers"].hits, 1);
        assert_eq!(metrics["transfers"].misses, 2);
    }

    #[tokio::test]
    async fn test_transfer_invalidation_clears_shop_inventory() {
        let (service, _, cache) = service().await;
        cache.set("inventory:summary:shop-1|", &json!({"total": 1}), None).await.unwrap();
        cache.set("inventory:summary:shop-9|", &json!({"total": 9}), None).await.unwrap();

        service
            .invalidate(&TransferChange {
                transfer_id: None,
                from_shop_id: Some(1),
                to_shop_id: Some(1),
            })
            .await;

        assert!(!cache.exists("inventory:summary:shop-1|").await.unwrap());
        assert!(cache.exists("inventory:summary:shop-9|").await.unwrap());
    }

    #[tokio::test]
    async fn test_warming_populates_default_filters() {
        let (service, loader, _) = service().await;

        let outcome = service.warm().await;
        assert_eq!(outcome.populated, 2);

        service.list(&TransferFilters::page(1, 20)).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.metrics()["transfers"].hits, 1);
    }
}
