//! # Inventory Cache Service
//!
//! Key layout:
//! - `inventory:list:{scope}|page:..|limit:..|search:..|category:..|status:..|from:..|to:..|`
//! - `inventory:summary:{scope}|`, `inventory:alerts:{scope}|`
//! - `inventory:analytics:{scope}|from:..|to:..|`
//! - `inventory:product:{id}`
//!
//! `scope` is `shop-{id}` or `all`.

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
use tracing::{info, warn};

const POPULAR_FILTERS_KEY: &str = "inventory:popular-filters";

/// Inventory list filters; only present fields take part in the key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InventoryFilters {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub search: Option<String>,
    pub category_id: Option<u64>,
    pub status: Option<String>,
    pub shop_id: Option<u64>,
    pub date_range: Option<DateRange>,
}

impl InventoryFilters {
    pub fn page(page: u32, limit: u32) -> Self {
        Self {
            page: Some(page),
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn cache_key(&self) -> String {
        FilterKeyBuilder::new("inventory:list", &shop_scope(self.shop_id))
            .field("page", self.page)
            .field("limit", self.limit)
            .text("search", self.search.as_deref())
            .field("category", self.category_id)
            .text("status", self.status.as_deref())
            .field("from", self.date_range.map(|r| r.from))
            .field("to", self.date_range.map(|r| r.to))
            .build()
    }
}

/// What changed in the inventory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryChange {
    pub product_id: Option<u64>,
    pub shop_ids: Vec<u64>,
    pub category_id: Option<u64>,
}

/// Invalidation patterns covering everything an inventory change can affect
pub fn inventory_patterns(change: &InventoryChange) -> Vec<String> {
    let mut patterns = BTreeSet::new();

    // Aggregates for the touched shops plus the cross-shop view
    let scopes: Vec<String> = if change.shop_ids.is_empty() {
        vec!["*".to_string()]
    } else {
        change
            .shop_ids
            .iter()
            .map(|id| format!("{}|*", shop_scope(Some(*id))))
            .chain(std::iter::once("all|*".to_string()))
            .collect()
    };
    for scope in &scopes {
        for kind in ["summary", "alerts", "analytics"] {
            patterns.insert(format!("inventory:{}:{}", kind, scope));
        }
    }

    if let Some(product_id) = change.product_id {
        // A product can appear in any list
        patterns.insert(format!("inventory:product:{}", product_id));
        patterns.insert("inventory:list:*".to_string());
        return patterns.into_iter().collect();
    }

    if let Some(category_id) = change.category_id {
        patterns.insert(format!("inventory:list:*|category:{}|*", category_id));
    }
    if !change.shop_ids.is_empty() || change.category_id.is_none() {
        for scope in &scopes {
            patterns.insert(format!("inventory:list:{}", scope));
        }
    }

    patterns.into_iter().collect()
}

fn summary_key(kind: &str, shop_id: Option<u64>) -> String {
    FilterKeyBuilder::new(&format!("inventory:{}", kind), &shop_scope(shop_id)).build()
}

fn analytics_key(shop_id: Option<u64>, range: Option<DateRange>) -> String {
    FilterKeyBuilder::new("inventory:analytics", &shop_scope(shop_id))
        .field("from", range.map(|r| r.from))
        .field("to", range.map(|r| r.to))
        .build()
}

/// Inventory data source consulted on a miss
#[async_trait]
pub trait InventoryLoader: Send + Sync + 'static {
    async fn load_list(&self, filters: &InventoryFilters) -> LayerResult<Value>;

    async fn load_summary(&self, shop_id: Option<u64>) -> LayerResult<Value>;

    async fn load_alerts(&self, shop_id: Option<u64>) -> LayerResult<Value>;

    async fn load_analytics(&self, shop_id: Option<u64>, range: Option<DateRange>) -> LayerResult<Value>;

    async fn load_product(&self, product_id: u64) -> LayerResult<Value>;
}

/// Inventory cache service
pub struct InventoryCacheService {
    domain: DomainCache,
    loader: Arc<dyn InventoryLoader>,
    popular: Option<Arc<dyn PopularFilterSource>>,
    warming_config: WarmingConfig,
    warming: Mutex<Option<WarmingTask>>,
}

impl InventoryCacheService {
    pub fn new(
        cache: Arc<CacheManager>,
        monitor: Arc<PerformanceMonitor>,
        loader: Arc<dyn InventoryLoader>,
        popular: Option<Arc<dyn PopularFilterSource>>,
        config: &CacheLayerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain: DomainCache::new("inventory", cache, monitor),
            loader,
            popular,
            warming_config: config.warming.clone(),
            warming: Mutex::new(None),
        })
    }

    /// Start the warming schedule (no-op when disabled or already running)
    pub fn start_warming(self: &Arc<Self>) {
        let mut warming = self.warming.lock();
        if warming.is_none() {
            *warming = WarmingTask::spawn(self, &self.warming_config);
        }
    }

    pub async fn list(&self, filters: &InventoryFilters) -> LayerResult<Value> {
        let loader = self.loader.clone();
        let owned = filters.clone();
        self.domain
            .read(&filters.cache_key(), self.ttl(CacheCategory::InventoryList), move || async move {
                loader.load_list(&owned).await
            })
            .await
    }

    pub async fn summary(&self, shop_id: Option<u64>) -> LayerResult<Value> {
        let loader = self.loader.clone();
        self.domain
            .read(
                &summary_key("summary", shop_id),
                self.ttl(CacheCategory::InventorySummary),
                move || async move { loader.load_summary(shop_id).await },
            )
            .await
    }

    pub async fn alerts(&self, shop_id: Option<u64>) -> LayerResult<Value> {
        let loader = self.loader.clone();
        self.domain
            .read(
                &summary_key("alerts", shop_id),
                self.ttl(CacheCategory::InventorySummary),
                move || async move { loader.load_alerts(shop_id).await },
            )
            .await
    }

    pub async fn analytics(&self, shop_id: Option<u64>, range: Option<DateRange>) -> LayerResult<Value> {
        let loader = self.loader.clone();
        self.domain
            .read(
                &analytics_key(shop_id, range),
                self.ttl(CacheCategory::Analytics),
                move || async move { loader.load_analytics(shop_id, range).await },
            )
            .await
    }

    pub async fn product(&self, product_id: u64) -> LayerResult<Value> {
        let loader = self.loader.clone();
        self.domain
            .read(
                &format!("inventory:product:{}", product_id),
                self.ttl(CacheCategory::InventoryList),
                move || async move { loader.load_product(product_id).await },
            )
            .await
    }

    /// Invalidate everything an inventory change can affect
    pub async fn invalidate(&self, change: &InventoryChange) -> usize {
        let patterns = inventory_patterns(change);
        let removed = self.domain.invalidate_patterns(&patterns).await;
        info!(
            product = ?change.product_id,
            shops = ?change.shop_ids,
            category = ?change.category_id,
            "Inventory invalidation removed {} keys",
            removed
        );
        removed
    }

    /// Popular filter combinations, cached; falls back to built-in defaults
    pub async fn popular_filters(&self) -> Vec<InventoryFilters> {
        let manager = self.domain.manager();
        if let Ok(Some(cached)) = manager.get::<Vec<InventoryFilters>>(POPULAR_FILTERS_KEY).await {
            if !cached.is_empty() {
                return cached;
            }
        }

        let discovered = match &self.popular {
            Some(source) => match source.popular_inventory_filters().await {
                Ok(filters) => filters,
                Err(e) => {
                    warn!("Popular inventory filter discovery failed: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if discovered.is_empty() {
            return default_filters();
        }

        let ttl = self.ttl(CacheCategory::PopularFilters);
        if let Err(e) = manager.set(POPULAR_FILTERS_KEY, &discovered, Some(ttl)).await {
            warn!("Could not cache popular inventory filters: {}", e);
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

    fn ttl(&self, category: CacheCategory) -> std::time::Duration {
        self.domain.manager().ttl_for(category)
    }
}

fn default_filters() -> Vec<InventoryFilters> {
    vec![
        InventoryFilters::page(1, 20),
        InventoryFilters::page(1, 50),
        InventoryFilters {
            status: Some("low_stock".to_string()),
            ..InventoryFilters::page(1, 20)
        },
    ]
}

#[async_trait]
impl Warmable for InventoryCacheService {
    fn warming_name(&self) -> &'static str {
        "inventory"
    }

    async fn warm(&self) -> WarmingOutcome {
        let mut outcome = WarmingOutcome::default();

        for filters in self.popular_filters().await {
            let loader = &self.loader;
            let result = self
                .domain
                .warm_key(&filters.cache_key(), self.ttl(CacheCategory::InventoryList), || {
                    loader.load_list(&filters)
                })
                .await;
            outcome.merge(result);
        }

        let loader = &self.loader;
        outcome.merge(
            self.domain
                .warm_key(
                    &summary_key("summary", None),
                    self.ttl(CacheCategory::InventorySummary),
                    || loader.load_summary(None),
                )
                .await,
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::LayerError;
    use crate::observability::performance::PerformanceConfig;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeLoader {
        list_calls: AtomicUsize,
        summary_calls: AtomicUsize,
    }

    #[async_trait]
    impl InventoryLoader for FakeLoader {
        async fn load_list(&self, filters: &InventoryFilters) -> LayerResult<Value> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if filters.search.as_deref() == Some("explode") {
                return Err(LayerError::loader("inventory", "query failed"));
            }
            Ok(json!({ "page": filters.page, "items": [] }))
        }

        async fn load_summary(&self, shop_id: Option<u64>) -> LayerResult<Value> {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "shop": shop_id, "total_items": 12 }))
        }

        async fn load_alerts(&self, _shop_id: Option<u64>) -> LayerResult<Value> {
            Ok(json!([]))
        }

        async fn load_analytics(&self, _shop_id: Option<u64>, _range: Option<DateRange>) -> LayerResult<Value> {
            Ok(json!({ "turnover": 1.5 }))
        }

        async fn load_product(&self, product_id: u64) -> LayerResult<Value> {
            Ok(json!({ "id": product_id }))
        }
    }

    struct StaticSource(Vec<InventoryFilters>);

    #[async_trait]
    impl PopularFilterSource for StaticSource {
        async fn popular_inventory_filters(&self) -> LayerResult<Vec<InventoryFilters>> {
            Ok(self.0.clone())
        }
    }

    async fn service_with(
        popular: Option<Arc<dyn PopularFilterSource>>,
    ) -> (Arc<InventoryCacheService>, Arc<FakeLoader>) {
        let config = CacheLayerConfig::default();
        let cache = Arc::new(CacheManager::new(config.clone()).await.unwrap());
        let monitor = Arc::new(PerformanceMonitor::new(PerformanceConfig::default()));
        let loader = Arc::new(FakeLoader::default());
        let service = InventoryCacheService::new(cache, monitor, loader.clone(), popular, &config);
        (service, loader)
    }

    #[test]
    fn test_filter_key_only_includes_present_fields() {
        let filters = InventoryFilters {
            search: Some("bolt".to_string()),
            category_id: Some(3),
            shop_id: Some(2),
            ..InventoryFilters::page(1, 20)
        };
        assert_eq!(
            filters.cache_key(),
            "inventory:list:shop-2|page:1|limit:20|search:bolt|category:3|"
        );

        let ranged = InventoryFilters {
            date_range: Some(DateRange {
                from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                to: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            }),
            ..Default::default()
        };
        assert_eq!(ranged.cache_key(), "inventory:list:all|from:2024-01-01|to:2024-01-31|");
    }

    #[test]
    fn test_patterns_for_shop_change() {
        let patterns = inventory_patterns(&InventoryChange {
            shop_ids: vec![4],
            ..Default::default()
        });
        assert!(patterns.contains(&"inventory:list:shop-4|*".to_string()));
        assert!(patterns.contains(&"inventory:list:all|*".to_string()));
        assert!(patterns.contains(&"inventory:summary:shop-4|*".to_string()));
        assert!(patterns.contains(&"inventory:alerts:all|*".to_string()));
        assert!(!patterns.iter().any(|p| p.contains("shop-5")));
    }

    #[test]
    fn test_patterns_for_product_change_cover_all_lists() {
        let patterns = inventory_patterns(&InventoryChange {
            product_id: Some(11),
            shop_ids: vec![1],
            category_id: Some(3),
        });
        assert!(patterns.contains(&"inventory:product:11".to_string()));
        assert!(patterns.contains(&"inventory:list:*".to_string()));
        // Covered by the list wildcard
        assert!(!patterns.iter().any(|p| p.contains("category:3")));
    }

    #[tokio::test]
    async fn test_list_is_cached_after_first_read() {
        let (service, loader) = service_with(None).await;
        let filters = InventoryFilters::page(2, 20);

        let first = service.list(&filters).await.unwrap();
        let second = service.list(&filters).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 1);

        let metrics = service.metrics();
        assert_eq!(metrics["inventory"].hits, 1);
        assert_eq!(metrics["inventory"].misses, 1);

        service.reset_metrics();
        assert!(service.metrics().is_empty());
    }

    #[tokio::test]
    async fn test_miss_counts_once_in_manager_stats() {
        let config = CacheLayerConfig::default();
        let cache = Arc::new(CacheManager::new(config.clone()).await.unwrap());
        let monitor = Arc::new(PerformanceMonitor::new(PerformanceConfig::default()));
        let loader = Arc::new(FakeLoader::default());
        let service = InventoryCacheService::new(cache.clone(), monitor, loader, None, &config);

        service.list(&InventoryFilters::page(1, 20)).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(service.metrics()["inventory"].misses, 1);
    }

    #[tokio::test]
    async fn test_loader_error_reaches_caller() {
        let (service, _) = service_with(None).await;
        let filters = InventoryFilters {
            search: Some("explode".to_string()),
            ..InventoryFilters::page(1, 20)
        };
        assert!(matches!(service.list(&filters).await, Err(LayerError::Loader { .. })));
    }

    #[tokio::test]
    async fn test_category_change_only_drops_matching_lists() {
        let (service, loader) = service_with(None).await;
        let tools = InventoryFilters {
            category_id: Some(3),
            ..InventoryFilters::page(1, 20)
        };
        let food = InventoryFilters {
            category_id: Some(33),
            ..InventoryFilters::page(1, 20)
        };
        service.list(&tools).await.unwrap();
        service.list(&food).await.unwrap();
        service.summary(None).await.unwrap();

        let removed = service
            .invalidate(&InventoryChange {
                category_id: Some(3),
                ..Default::default()
            })
            .await;
        // The category 3 list and the summary
        assert_eq!(removed, 2);

        service.list(&food).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 2);
        service.list(&tools).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 3);
        service.summary(None).await.unwrap();
        assert_eq!(loader.summary_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shop_change_keeps_other_shops() {
        let (service, loader) = service_with(None).await;
        let shop_1 = InventoryFilters {
            shop_id: Some(1),
            ..InventoryFilters::page(1, 20)
        };
        let shop_2 = InventoryFilters {
            shop_id: Some(2),
            ..InventoryFilters::page(1, 20)
        };
        service.list(&shop_1).await.unwrap();
        service.list(&shop_2).await.unwrap();

        service
            .invalidate(&InventoryChange {
                shop_ids: vec![1],
                ..Default::default()
            })
            .await;

        service.list(&shop_2).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 2);
        service.list(&shop_1).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_warming_then_request_is_a_hit() {
        let (service, loader) = service_with(None).await;

        let outcome = service.warm().await;
        assert_eq!(outcome.failed, 0);
        assert!(outcome.populated >= 1);
        let warmed_calls = loader.list_calls.load(Ordering::SeqCst);

        service.list(&InventoryFilters::page(1, 20)).await.unwrap();
        assert_eq!(loader.list_calls.load(Ordering::SeqCst), warmed_calls);
        assert_eq!(service.metrics()["inventory"].hits, 1);

        // A second pass finds everything present
        let again = service.warm().await;
        assert_eq!(again.populated, 0);
    }

    #[tokio::test]
    async fn test_popular_filters_from_source_are_cached() {
        let source = Arc::new(StaticSource(vec![InventoryFilters::page(3, 10)]));
        let (service, _) = service_with(Some(source)).await;

        let filters = service.popular_filters().await;
        assert_eq!(filters, vec![InventoryFilters::page(3, 10)]);
        let cached: Option<Vec<InventoryFilters>> =
            service.domain.manager().get(POPULAR_FILTERS_KEY).await.unwrap();
        assert_eq!(cached, Some(filters));
    }

    #[tokio::test]
    async fn test_popular_filters_fall_back_to_defaults() {
        let (service, _) = service_with(Some(Arc::new(StaticSource(Vec::new())))).await;
        assert_eq!(service.popular_filters().await, default_filters());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_warming_populates_cache() {
        let (service, loader) = service_with(None).await;
        service.start_warming();

        tokio::time::advance(Duration::from_secs(31)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(loader.list_calls.load(Ordering::SeqCst) >= 1);

        service.shutdown().await;
    }
}
