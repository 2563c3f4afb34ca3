//! # Configuration Module
//!
//! Configuration for the cache layer, read once at process start.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Human readable durations (`"5m"`, `"30s"`) through `humantime-serde`
//! - Environment variable overrides (`CACHE_<SECTION>_<FIELD>`)
//! - Validation with descriptive error messages
//!
//! Every tunable the layer uses lives here or in the per-module config structs
//! it embeds; nothing in the subsystem hard-codes a TTL or sweep interval.

use crate::caching::deduplication::DeduplicationConfig;
use crate::caching::stores::memory::InMemoryCacheConfig;
use crate::caching::stores::redis_store::RedisCacheConfig;
use crate::caching::stores::{BackendKind, MAX_TTL};
use crate::core::error::{LayerError, LayerResult};
use crate::observability::logging::{LogConfig, LogFormat};
use crate::observability::performance::PerformanceConfig;
use crate::services::warming::WarmingConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Longest period a background task ticks with
const MAX_TASK_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Deployment environment, used to pick the preferred cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
    Development,
    Test,
}

impl Environment {
    /// Production-like deployments prefer the network cache when one is configured
    pub fn is_production_like(&self) -> bool {
        matches!(self, Self::Production | Self::Staging)
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::Development
    }
}

impl FromStr for Environment {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" | "stage" => Ok(Self::Staging),
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            other => Err(LayerError::config(format!("Unknown environment: {}", other))),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Data categories with their own TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheCategory {
    InventorySummary,
    InventoryList,
    Analytics,
    Transfers,
    Invoices,
    Stats,
    ReferenceData,
    AuthSession,
    AuthPermissions,
    RolePermissions,
    TokenValidation,
    PopularFilters,
}

/// Time-to-live per data category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Fallback TTL when a caller does not pass one
    #[serde(with = "humantime_serde")]
    pub default: Duration,

    #[serde(with = "humantime_serde")]
    pub inventory_summary: Duration,

    #[serde(with = "humantime_serde")]
    pub inventory_list: Duration,

    #[serde(with = "humantime_serde")]
    pub analytics: Duration,

    #[serde(with = "humantime_serde")]
    pub transfers: Duration,

    #[serde(with = "humantime_serde")]
    pub invoices: Duration,

    #[serde(with = "humantime_serde")]
    pub stats: Duration,

    #[serde(with = "humantime_serde")]
    pub reference_data: Duration,

    #[serde(with = "humantime_serde")]
    pub auth_session: Duration,

    #[serde(with = "humantime_serde")]
    pub auth_permissions: Duration,

    #[serde(with = "humantime_serde")]
    pub role_permissions: Duration,

    #[serde(with = "humantime_serde")]
    pub token_validation: Duration,

    /// Popular filter discovery is expensive and changes slowly
    #[serde(with = "humantime_serde")]
    pub popular_filters: Duration,
}

impl TtlConfig {
    /// TTL configured for a data category
    pub fn for_category(&self, category: CacheCategory) -> Duration {
        match category {
            CacheCategory::InventorySummary => self.inventory_summary,
            CacheCategory::InventoryList => self.inventory_list,
            CacheCategory::Analytics => self.analytics,
            CacheCategory::Transfers => self.transfers,
            CacheCategory::Invoices => self.invoices,
            CacheCategory::Stats => self.stats,
            CacheCategory::ReferenceData => self.reference_data,
            CacheCategory::AuthSession => self.auth_session,
            CacheCategory::AuthPermissions => self.auth_permissions,
            CacheCategory::RolePermissions => self.role_permissions,
            CacheCategory::TokenValidation => self.token_validation,
            CacheCategory::PopularFilters => self.popular_filters,
        }
    }

    fn entries(&self) -> [(&'static str, Duration); 13] {
        [
            ("default", self.default),
            ("inventory_summary", self.inventory_summary),
            ("inventory_list", self.inventory_list),
            ("analytics", self.analytics),
            ("transfers", self.transfers),
            ("invoices", self.invoices),
            ("stats", self.stats),
            ("reference_data", self.reference_data),
            ("auth_session", self.auth_session),
            ("auth_permissions", self.auth_permissions),
            ("role_permissions", self.role_permissions),
            ("token_validation", self.token_validation),
            ("popular_filters", self.popular_filters),
        ]
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(300),
            inventory_summary: Duration::from_secs(300),
            inventory_list: Duration::from_secs(120),
            analytics: Duration::from_secs(900),
            transfers: Duration::from_secs(180),
            invoices: Duration::from_secs(120),
            stats: Duration::from_secs(600),
            reference_data: Duration::from_secs(3600),
            auth_session: Duration::from_secs(900),
            auth_permissions: Duration::from_secs(600),
            role_permissions: Duration::from_secs(1800),
            token_validation: Duration::from_secs(300),
            popular_filters: Duration::from_secs(3600),
        }
    }
}

/// Complete cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLayerConfig {
    /// Deployment environment
    pub environment: Environment,

    /// Network cache settings; an absent URL means in-process only
    pub redis: RedisCacheConfig,

    /// In-process cache settings
    pub memory: InMemoryCacheConfig,

    /// TTL per data category
    pub ttl: TtlConfig,

    /// Request deduplication settings
    pub deduplication: DeduplicationConfig,

    /// Predictive warming schedule for the domain services
    pub warming: WarmingConfig,

    /// Metrics recorder settings
    pub performance: PerformanceConfig,

    /// Logging settings
    pub logging: LogConfig,

    /// Maximum accepted cache key length
    pub max_key_length: usize,

    /// Share one fetch between concurrent `get_or_set` misses on the same key
    pub coalesce_get_or_set: bool,
}

impl Default for CacheLayerConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            redis: RedisCacheConfig::default(),
            memory: InMemoryCacheConfig::default(),
            ttl: TtlConfig::default(),
            deduplication: DeduplicationConfig::default(),
            warming: WarmingConfig::default(),
            performance: PerformanceConfig::default(),
            logging: LogConfig::default(),
            max_key_length: 512,
            coalesce_get_or_set: true,
        }
    }
}

impl CacheLayerConfig {
    /// Load configuration from a YAML file, then apply environment overrides
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> LayerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LayerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: CacheLayerConfig = serde_yaml::from_str(&content)
            .map_err(|e| LayerError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file, then apply environment overrides
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> LayerResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| LayerError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: CacheLayerConfig = serde_json::from_str(&content)
            .map_err(|e| LayerError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> LayerResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Backend the layer will construct for this configuration
    pub fn backend_kind(&self) -> BackendKind {
        match &self.redis.url {
            Some(url) if !url.is_empty() && self.environment.is_production_like() => BackendKind::Redis,
            _ => BackendKind::Memory,
        }
    }

    /// Apply overrides from the process environment
    ///
    /// Variables follow the pattern `CACHE_<SECTION>_<FIELD>`, e.g.
    /// `CACHE_TTL_INVOICES=2m`. `REDIS_URL` is honoured when
    /// `CACHE_REDIS_URL` is not set.
    pub fn apply_env_overrides(&mut self) -> LayerResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> LayerResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup("CACHE_ENVIRONMENT") {
            self.environment = env.parse()?;
        }

        if let Some(url) = lookup("CACHE_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            self.redis.url = if url.trim().is_empty() { None } else { Some(url) };
        }
        if let Some(prefix) = lookup("CACHE_REDIS_KEY_PREFIX") {
            self.redis.key_prefix = prefix;
        }
        override_duration(&lookup, "CACHE_REDIS_CONNECT_TIMEOUT", &mut self.redis.connection_timeout)?;
        override_duration(&lookup, "CACHE_REDIS_OPERATION_TIMEOUT", &mut self.redis.operation_timeout)?;
        override_duration(&lookup, "CACHE_REDIS_RECONNECT_BACKOFF", &mut self.redis.reconnect_backoff)?;

        override_parse(&lookup, "CACHE_MEMORY_MAX_ENTRIES", &mut self.memory.max_entries)?;
        override_duration(&lookup, "CACHE_MEMORY_SWEEP_INTERVAL", &mut self.memory.cleanup_interval)?;

        override_duration(&lookup, "CACHE_TTL_DEFAULT", &mut self.ttl.default)?;
        override_duration(&lookup, "CACHE_TTL_INVENTORY_SUMMARY", &mut self.ttl.inventory_summary)?;
        override_duration(&lookup, "CACHE_TTL_INVENTORY_LIST", &mut self.ttl.inventory_list)?;
        override_duration(&lookup, "CACHE_TTL_ANALYTICS", &mut self.ttl.analytics)?;
        override_duration(&lookup, "CACHE_TTL_TRANSFERS", &mut self.ttl.transfers)?;
        override_duration(&lookup, "CACHE_TTL_INVOICES", &mut self.ttl.invoices)?;
        override_duration(&lookup, "CACHE_TTL_STATS", &mut self.ttl.stats)?;
        override_duration(&lookup, "CACHE_TTL_REFERENCE_DATA", &mut self.ttl.reference_data)?;
        override_duration(&lookup, "CACHE_TTL_AUTH_SESSION", &mut self.ttl.auth_session)?;
        override_duration(&lookup, "CACHE_TTL_AUTH_PERMISSIONS", &mut self.ttl.auth_permissions)?;
        override_duration(&lookup, "CACHE_TTL_ROLE_PERMISSIONS", &mut self.ttl.role_permissions)?;
        override_duration(&lookup, "CACHE_TTL_TOKEN_VALIDATION", &mut self.ttl.token_validation)?;
        override_duration(&lookup, "CACHE_TTL_POPULAR_FILTERS", &mut self.ttl.popular_filters)?;

        override_duration(&lookup, "CACHE_DEDUP_MAX_AGE", &mut self.deduplication.max_age)?;
        override_parse(&lookup, "CACHE_DEDUP_MAX_CONCURRENT", &mut self.deduplication.max_concurrent)?;
        override_duration(&lookup, "CACHE_DEDUP_SWEEP_INTERVAL", &mut self.deduplication.sweep_interval)?;

        override_parse(&lookup, "CACHE_WARMING_ENABLED", &mut self.warming.enabled)?;
        override_duration(&lookup, "CACHE_WARMING_INITIAL_DELAY", &mut self.warming.initial_delay)?;
        override_duration(&lookup, "CACHE_WARMING_INTERVAL", &mut self.warming.interval)?;

        override_duration(&lookup, "CACHE_METRICS_REPORT_INTERVAL", &mut self.performance.report_interval)?;
        override_duration(&lookup, "CACHE_METRICS_MAX_AGE", &mut self.performance.max_age)?;

        if let Some(level) = lookup("CACHE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CACHE_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "pretty" => LogFormat::Text,
                other => {
                    return Err(LayerError::config(format!("Invalid CACHE_LOG_FORMAT: {}", other)))
                }
            };
        }

        override_parse(&lookup, "CACHE_MAX_KEY_LENGTH", &mut self.max_key_length)?;
        override_parse(&lookup, "CACHE_COALESCE_GET_OR_SET", &mut self.coalesce_get_or_set)?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> LayerResult<()> {
        for (name, ttl) in self.ttl.entries() {
            if ttl.is_zero() {
                return Err(LayerError::config(format!("TTL '{}' must be greater than zero", name)));
            }
            if ttl > MAX_TTL {
                return Err(LayerError::config(format!(
                    "TTL '{}' exceeds the maximum of {}",
                    name,
                    humantime::format_duration(MAX_TTL)
                )));
            }
        }

        if let Some(url) = &self.redis.url {
            let parsed = Url::parse(url)
                .map_err(|e| LayerError::config(format!("Invalid redis url '{}': {}", url, e)))?;
            if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
                return Err(LayerError::config(format!(
                    "Unsupported redis url scheme: {}",
                    parsed.scheme()
                )));
            }
        }
        if self.redis.connection_timeout.is_zero() || self.redis.operation_timeout.is_zero() {
            return Err(LayerError::config("Redis timeouts must be greater than zero"));
        }

        if self.memory.max_entries == 0 {
            return Err(LayerError::config("memory.max_entries must be greater than zero"));
        }
        if self.memory.cleanup_interval.is_zero() {
            return Err(LayerError::config("memory.cleanup_interval must be greater than zero"));
        }

        if self.deduplication.max_concurrent == 0 {
            return Err(LayerError::config("deduplication.max_concurrent must be greater than zero"));
        }
        if self.deduplication.max_age.is_zero() || self.deduplication.sweep_interval.is_zero() {
            return Err(LayerError::config(
                "deduplication.max_age and sweep_interval must be greater than zero",
            ));
        }

        if self.warming.interval.is_zero() {
            return Err(LayerError::config("warming.interval must be greater than zero"));
        }

        if self.performance.report_interval.is_zero() || self.performance.max_entries == 0 {
            return Err(LayerError::config(
                "performance.report_interval and max_entries must be greater than zero",
            ));
        }

        if self.max_key_length == 0 {
            return Err(LayerError::config("max_key_length must be greater than zero"));
        }

        Ok(())
    }
}

/// Period for a background task; zero falls back to `fallback`, huge values are capped
pub(crate) fn task_period(task: &str, period: Duration, fallback: Duration) -> Duration {
    if period.is_zero() {
        warn!("{} period must be greater than zero, using {:?}", task, fallback);
        return fallback;
    }
    period.min(MAX_TASK_PERIOD)
}

fn override_duration<F>(lookup: &F, name: &str, target: &mut Duration) -> LayerResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup(name) {
        *target = humantime::parse_duration(&value)
            .map_err(|e| LayerError::config(format!("Invalid {}: {}", name, e)))?;
    }
    Ok(())
}

fn override_parse<F, T>(lookup: &F, name: &str, target: &mut T) -> LayerResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    if let Some(value) = lookup(name) {
        *target = value
            .trim()
            .parse()
            .map_err(|e| LayerError::config(format!("Invalid {}: {}", name, e)))?;
    }
    Ok(())
}
