//! # Performance Monitor
//!
//! Records named operation durations into a bounded, append-only log and
//! aggregates them on demand. Every recorded duration is also forwarded to the
//! `metrics` facade as the histogram `cache_layer_operation_duration_seconds`
//! labelled with the operation name.
//!
//! Timers started with [`PerformanceMonitor::start_timer`] are keyed by name,
//! so starting the same name twice restarts it. [`PerformanceMonitor::measure`]
//! does not share that map and is safe for concurrent use.

use crate::core::config::task_period;
use chrono::{DateTime, Utc};
use metrics::histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Free-form metric annotations
pub type Metadata = HashMap<String, serde_json::Value>;

/// Performance monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// How often the aggregated report is logged
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,

    /// Metrics older than this are pruned
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Upper bound on retained metrics
    pub max_entries: usize,

    /// Durations at or above this are reported as slow
    #[serde(with = "humantime_serde")]
    pub slow_threshold: Duration,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            max_entries: 10_000,
            slow_threshold: Duration::from_secs(1),
        }
    }
}

/// A single recorded duration
#[derive(Debug, Clone, Serialize)]
pub struct Metric {
    pub name: String,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    #[serde(skip)]
    recorded_at: Instant,
}

/// Aggregated statistics for one operation name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub count: usize,
    pub avg: Duration,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub total_metrics: usize,
    pub operations: BTreeMap<String, MetricStats>,
    /// Slowest recorded operations, slowest first
    pub slowest: Vec<Metric>,
    /// Metrics at or above the slow threshold
    pub slow_count: usize,
}

struct Inner {
    config: PerformanceConfig,
    metrics: Mutex<VecDeque<Metric>>,
    timers: Mutex<HashMap<String, Instant>>,
}

impl Inner {
    fn record(&self, name: &str, duration: Duration, metadata: Metadata) {
        histogram!("cache_layer_operation_duration_seconds", "operation" => name.to_string())
            .record(duration.as_secs_f64());

        if duration >= self.config.slow_threshold {
            debug!("Slow operation {}: {:?}", name, duration);
        }

        let mut metrics = self.metrics.lock();
        metrics.push_back(Metric {
            name: name.to_string(),
            duration,
            timestamp: Utc::now(),
            metadata,
            recorded_at: Instant::now(),
        });
        while metrics.len() > self.config.max_entries {
            metrics.pop_front();
        }
    }

    fn prune(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age;
        let mut metrics = self.metrics.lock();
        let before = metrics.len();

        // The log is in insertion order, so stale metrics are at the front
        while metrics
            .front()
            .map_or(false, |m| now.saturating_duration_since(m.recorded_at) > max_age)
        {
            metrics.pop_front();
        }
        while metrics.len() > self.config.max_entries {
            metrics.pop_front();
        }

        before - metrics.len()
    }

    fn report(&self) -> PerformanceReport {
        let metrics: Vec<Metric> = self.metrics.lock().iter().cloned().collect();

        let mut grouped: BTreeMap<String, Vec<Duration>> = BTreeMap::new();
        for metric in metrics.iter() {
            grouped.entry(metric.name.clone()).or_default().push(metric.duration);
        }
        let operations = grouped
            .into_iter()
            .filter_map(|(name, durations)| aggregate(&durations).map(|stats| (name, stats)))
            .collect();

        let total_metrics = metrics.len();
        let slow_count = metrics
            .iter()
            .filter(|m| m.duration >= self.config.slow_threshold)
            .count();

        let mut slowest = metrics;
        slowest.sort_by(|a, b| b.duration.cmp(&a.duration));
        slowest.truncate(10);

        PerformanceReport {
            generated_at: Utc::now(),
            total_metrics,
            operations,
            slowest,
            slow_count,
        }
    }
}

fn aggregate(durations: &[Duration]) -> Option<MetricStats> {
    let min = *durations.iter().min()?;
    let max = *durations.iter().max()?;
    let total = durations.iter().fold(Duration::ZERO, |sum, d| sum.saturating_add(*d));
    Some(MetricStats {
        count: durations.len(),
        avg: mean_duration(total, durations.len() as u64),
        min,
        max,
        total,
    })
}

/// Average of `count` samples summing to `total`; zero when there are none
pub(crate) fn mean_duration(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Operation timing recorder
pub struct PerformanceMonitor {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    report_task: Mutex<Option<JoinHandle<()>>>,
}

impl PerformanceMonitor {
    /// Create a monitor and start its periodic report task
    pub fn new(config: PerformanceConfig) -> Self {
        let inner = Arc::new(Inner {
            config,
            metrics: Mutex::new(VecDeque::new()),
            timers: Mutex::new(HashMap::new()),
        });
        let shutdown = CancellationToken::new();

        let report_task = {
            let inner = inner.clone();
            let token = shutdown.clone();
            let period = task_period(
                "Performance report",
                inner.config.report_interval,
                PerformanceConfig::default().report_interval,
            );

            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let pruned = inner.prune();
                            log_report(&inner.report(), pruned);
                        }
                    }
                }
            })
        };

        Self {
            inner,
            shutdown,
            report_task: Mutex::new(Some(report_task)),
        }
    }

    pub fn start_timer(&self, name: &str) {
        self.inner.timers.lock().insert(name.to_string(), Instant::now());
    }

    /// Stop a timer and record its duration; zero if it was never started
    pub fn end_timer(&self, name: &str) -> Duration {
        self.end_timer_with(name, Metadata::new())
    }

    pub fn end_timer_with(&self, name: &str, metadata: Metadata) -> Duration {
        let started = self.inner.timers.lock().remove(name);
        match started {
            Some(started) => {
                let elapsed = started.elapsed();
                self.inner.record(name, elapsed, metadata);
                elapsed
            }
            None => {
                warn!("Timer '{}' was ended without being started", name);
                Duration::ZERO
            }
        }
    }

    /// Time a fallible operation, tagging the metric with `success`
    ///
    /// The metric is recorded even if the future is dropped before
    /// completing, in which case `success` is `false`.
    pub async fn measure<T, E, Fut>(&self, name: &str, operation: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = MeasureGuard {
            inner: &self.inner,
            name,
            started: Instant::now(),
            success: false,
        };
        let result = operation.await;
        guard.success = result.is_ok();
        result
    }

    /// Record an externally measured duration
    pub fn record(&self, name: &str, duration: Duration, metadata: Metadata) {
        self.inner.record(name, duration, metadata);
    }

    pub fn get_stats(&self, name: &str) -> Option<MetricStats> {
        let durations: Vec<Duration> = self
            .inner
            .metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.duration)
            .collect();
        aggregate(&durations)
    }

    /// Metrics recorded under `name`, oldest first
    pub fn metrics_for(&self, name: &str) -> Vec<Metric> {
        self.inner
            .metrics
            .lock()
            .iter()
            .filter(|m| m.name == name)
            .cloned()
            .collect()
    }

    pub fn generate_report(&self) -> PerformanceReport {
        self.inner.report()
    }

    /// Drop metrics past the age and count bounds, returning how many were removed
    pub fn prune(&self) -> usize {
        self.inner.prune()
    }

    pub fn metric_count(&self) -> usize {
        self.inner.metrics.lock().len()
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.report_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.timers.lock().clear();
        debug!("Performance monitor stopped");
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct MeasureGuard<'a> {
    inner: &'a Inner,
    name: &'a str,
    started: Instant,
    success: bool,
}

impl Drop for MeasureGuard<'_> {
    fn drop(&mut self) {
        let mut metadata = Metadata::new();
        metadata.insert("success".to_string(), serde_json::Value::Bool(self.success));
        self.inner.record(self.name, self.started.elapsed(), metadata);
    }
}

fn log_report(report: &PerformanceReport, pruned: usize) {
    if report.total_metrics == 0 {
        return;
    }

    info!(
        total_metrics = report.total_metrics,
        slow_operations = report.slow_count,
        pruned = pruned,
        "Performance report"
    );
    for (name, stats) in &report.operations {
        info!(
            operation = %name,
            count = stats.count,
            avg_ms = stats.avg.as_secs_f64() * 1000.0,
            max_ms = stats.max.as_secs_f64() * 1000.0,
            "Operation timing"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn monitor() -> PerformanceMonitor {
        PerformanceMonitor::new(PerformanceConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_records_elapsed_duration() {
        let monitor = monitor();
        monitor.start_timer("inventory:list");
        advance(Duration::from_millis(120)).await;

        let elapsed = monitor.end_timer("inventory:list");
        assert_eq!(elapsed, Duration::from_millis(120));

        let stats = monitor.get_stats("inventory:list").unwrap();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.total, Duration::from_millis(120));
    }

    #[tokio::test]
    async fn test_end_without_start_is_zero() {
        let monitor = monitor();
        assert_eq!(monitor.end_timer("never-started"), Duration::ZERO);
        assert!(monitor.get_stats("never-started").is_none());
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let monitor = monitor();
        for ms in [10, 20, 60] {
            monitor.record("lookup", Duration::from_millis(ms), Metadata::new());
        }
        monitor.record("other", Duration::from_millis(5), Metadata::new());

        let stats = monitor.get_stats("lookup").unwrap();
        assert_eq!(
            stats,
            MetricStats {
                count: 3,
                avg: Duration::from_millis(30),
                min: Duration::from_millis(10),
                max: Duration::from_millis(60),
                total: Duration::from_millis(90),
            }
        );
    }

    #[test]
    fn test_mean_duration_handles_large_counts() {
        let count = 1u64 << 32;
        let total = Duration::from_nanos(count * 3);
        assert_eq!(mean_duration(total, count), Duration::from_nanos(3));
        assert_eq!(mean_duration(Duration::from_secs(5), 0), Duration::ZERO);
        assert_eq!(mean_duration(Duration::MAX, 1), Duration::from_nanos(u64::MAX));
    }

    #[tokio::test]
    async fn test_measure_tags_success() {
        let monitor = monitor();

        let ok: Result<u32, String> = monitor.measure("fetch", async { Ok(1) }).await;
        assert!(ok.is_ok());
        let err: Result<u32, String> = monitor.measure("fetch", async { Err("boom".to_string()) }).await;
        assert!(err.is_err());

        let recorded = monitor.metrics_for("fetch");
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].metadata["success"], serde_json::json!(true));
        assert_eq!(recorded[1].metadata["success"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn test_cancelled_measure_still_records() {
        let monitor = monitor();

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            monitor.measure("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(result.is_err());

        let recorded = monitor.metrics_for("slow");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].metadata["success"], serde_json::json!(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_by_age_and_count() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            max_age: Duration::from_secs(60),
            max_entries: 3,
            ..Default::default()
        });

        monitor.record("old", Duration::from_millis(1), Metadata::new());
        advance(Duration::from_secs(61)).await;
        for _ in 0..3 {
            monitor.record("new", Duration::from_millis(1), Metadata::new());
        }
        // Count bound already dropped the oldest on insert
        assert_eq!(monitor.metric_count(), 3);
        assert!(monitor.get_stats("old").is_none());

        monitor.record("newer", Duration::from_millis(1), Metadata::new());
        advance(Duration::from_secs(61)).await;
        assert_eq!(monitor.prune(), 3);
        assert_eq!(monitor.metric_count(), 0);
    }

    #[tokio::test]
    async fn test_report_lists_slowest_first() {
        let monitor = PerformanceMonitor::new(PerformanceConfig {
            slow_threshold: Duration::from_millis(100),
            ..Default::default()
        });
        monitor.record("a", Duration::from_millis(50), Metadata::new());
        monitor.record("b", Duration::from_millis(500), Metadata::new());
        monitor.record("a", Duration::from_millis(150), Metadata::new());

        let report = monitor.generate_report();
        assert_eq!(report.total_metrics, 3);
        assert_eq!(report.operations["a"].count, 2);
        assert_eq!(report.slowest[0].name, "b");
        assert_eq!(report.slowest[1].duration, Duration::from_millis(150));
        assert_eq!(report.slow_count, 2);

        monitor.shutdown().await;
    }
}
