//! # Cache Layer
//!
//! Owns every long-lived component of the subsystem: the cache manager and its
//! backend, the performance monitor, and the domain services with their warming
//! schedules. Nothing here is global; the host application builds one
//! [`CacheLayer`] at startup and calls [`CacheLayer::shutdown`] when it stops.

use crate::caching::{CacheManager, DedupHttpClient, HttpFetch};
use crate::core::config::CacheLayerConfig;
use crate::core::error::LayerResult;
use crate::observability::logging::init_logging;
use crate::observability::performance::PerformanceMonitor;
use crate::services::{InventoryCacheService, InventoryLoader, PopularFilterSource, TransferCacheService, TransferLoader};
use std::sync::Arc;
use tracing::info;

pub struct CacheLayer {
    config: CacheLayerConfig,
    cache: Arc<CacheManager>,
    monitor: Arc<PerformanceMonitor>,
    inventory: Option<Arc<InventoryCacheService>>,
    transfers: Option<Arc<TransferCacheService>>,
}

impl CacheLayer {
    /// Validate the configuration and build the core components
    pub async fn start(config: CacheLayerConfig) -> LayerResult<Self> {
        config.validate()?;

        let cache = Arc::new(CacheManager::new(config.clone()).await?);
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));

        info!(
            environment = %config.environment,
            backend = ?cache.backend_kind(),
            "Cache layer started"
        );

        Ok(Self {
            config,
            cache,
            monitor,
            inventory: None,
            transfers: None,
        })
    }

    /// Read configuration from `CACHE_*` variables, install logging, then start
    pub async fn from_env() -> LayerResult<Self> {
        let config = CacheLayerConfig::from_env()?;
        init_logging(&config.logging);
        Self::start(config).await
    }

    /// Attach the inventory service and start its warming schedule
    pub fn with_inventory(
        mut self,
        loader: Arc<dyn InventoryLoader>,
        popular: Option<Arc<dyn PopularFilterSource>>,
    ) -> Self {
        let service = InventoryCacheService::new(
            self.cache.clone(),
            self.monitor.clone(),
            loader,
            popular,
            &self.config,
        );
        service.start_warming();
        self.inventory = Some(service);
        self
    }

    /// Attach the transfer service and start its warming schedule
    pub fn with_transfers(
        mut self,
        loader: Arc<dyn TransferLoader>,
        popular: Option<Arc<dyn PopularFilterSource>>,
    ) -> Self {
        let service = TransferCacheService::new(
            self.cache.clone(),
            self.monitor.clone(),
            loader,
            popular,
            &self.config,
        );
        service.start_warming();
        self.transfers = Some(service);
        self
    }

    pub fn config(&self) -> &CacheLayerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn inventory(&self) -> Option<&Arc<InventoryCacheService>> {
        self.inventory.as_ref()
    }

    pub fn transfers(&self) -> Option<&Arc<TransferCacheService>> {
        self.transfers.as_ref()
    }

    /// Outbound HTTP client sharing this layer's deduplication settings
    pub fn http_client<F: HttpFetch>(&self, fetcher: F) -> DedupHttpClient<F> {
        DedupHttpClient::new(fetcher, self.config.deduplication.clone())
    }

    /// Stop warming, reporting and sweeps, then release backend connections
    pub async fn shutdown(&self) {
        if let Some(service) = &self.inventory {
            service.shutdown().await;
        }
        if let Some(service) = &self.transfers {
            service.shutdown().await;
        }
        self.monitor.shutdown().await;
        self.cache.shutdown().await;
        info!("Cache layer stopped");
    }
}
