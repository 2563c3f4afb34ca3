// Structured logging
pub mod logging;

// Operation timers and aggregated statistics
pub mod performance;

// Re-export commonly used types for convenience
pub use logging::{init_logging, LogConfig, LogFormat};
pub use performance::{MetricStats, PerformanceConfig, PerformanceMonitor, PerformanceReport};
