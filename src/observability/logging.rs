//! # Structured Logging
//!
//! Installs the global `tracing` subscriber for processes embedding the cache
//! layer. `RUST_LOG` takes precedence over the configured level, and calling
//! [`init_logging`] more than once is harmless.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `retail_cache=debug,info`
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

/// Build the filter: `RUST_LOG` if set and valid, otherwise the configured level
fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber
///
/// Returns `false` when a subscriber was already installed.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = env_filter(config);

    let installed = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        info!(format = ?config.format, level = %config.level, "Logging initialized");
    } else {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Text,
        };
        init_logging(&config);
        // A second call must not panic
        assert!(!init_logging(&config));
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let config = LogConfig {
            level: "not a directive=[".to_string(),
            format: LogFormat::Json,
        };
        // Building the filter must not panic on bad input
        let _ = env_filter(&config);
    }

    #[test]
    fn test_log_format_deserializes_lowercase() {
        let config: LogConfig = serde_json::from_str(r#"{"format":"text"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.level, "info");
    }
}
