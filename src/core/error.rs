//! # Error Handling Module
//!
//! Top-level error type for the cache layer. Subsystem errors (`CacheError`,
//! `DeduplicationError`) convert into [`LayerError`] so that code wiring the
//! layer together can use `?` across module boundaries.
//!
//! Only caller-input problems ever reach callers of the public cache API: an
//! unreachable backend is logged and degraded to a miss inside the stores, so
//! it never shows up here.

use crate::caching::deduplication::DeduplicationError;
use crate::caching::CacheError;
use thiserror::Error;

/// Result alias used by configuration loading and service construction
pub type LayerResult<T> = Result<T, LayerError>;

/// Errors raised while configuring, starting, or driving the cache layer
#[derive(Debug, Error)]
pub enum LayerError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Failure reported by the cache subsystem
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Failure reported by the request deduplicator
    #[error(transparent)]
    Deduplication(#[from] DeduplicationError),

    /// Failure reported by a domain data loader
    #[error("Loader error ({source_name}): {message}")]
    Loader { source_name: String, message: String },
}

impl LayerError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a loader error
    pub fn loader<S: Into<String>, M: Into<String>>(source_name: S, message: M) -> Self {
        Self::Loader {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Whether the error was caused by bad input from the caller
    pub fn is_caller_error(&self) -> bool {
        match self {
            Self::Configuration { .. } => true,
            Self::Cache(e) => e.is_caller_error(),
            _ => false,
        }
    }
}
