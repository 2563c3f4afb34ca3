//! # Retail Cache Library
//!
//! Caching and request-coordination layer for the retail backend (invoicing,
//! inventory, transfers). The host application builds a [`CacheLayer`] at
//! startup and reaches everything else through it.
//!
//! ## Module Layout
//! - `core`: configuration and the top-level error type
//! - `caching`: cache stores, the cache manager, key generation,
//!   invalidation and request deduplication
//! - `services`: inventory and transfer caches with warming and metrics
//! - `observability`: logging bootstrap and the performance monitor
//! - `layer`: the container owning all of the above

/// Configuration and error types shared by every other module
pub mod core;

/// Cache stores, cache manager, invalidation and request deduplication
pub mod caching;

/// Domain cache services built on the cache manager
pub mod services;

/// Structured logging and operation timing
pub mod observability;

/// Lifecycle container for the whole subsystem
pub mod layer;

pub use caching::{CacheError, CacheManager, CacheResult, RequestDeduplicator};
pub use core::config::{CacheLayerConfig, Environment};
pub use core::error::{LayerError, LayerResult};
pub use layer::CacheLayer;
