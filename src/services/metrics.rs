//! Hit/miss accounting for the domain cache services, keyed by the first
//! segment of the cache key.

use crate::observability::performance::mean_duration;
use metrics::counter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Cache effectiveness for one key prefix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`
    pub hit_rate: f64,
    /// Mean time to answer a read, hit or miss
    pub avg_response_time: Duration,
}

#[derive(Debug, Default)]
struct Accumulator {
    hits: u64,
    misses: u64,
    total_response_time: Duration,
}

impl Accumulator {
    fn snapshot(&self) -> CacheMetrics {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return CacheMetrics::default();
        }
        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            hit_rate: self.hits as f64 / lookups as f64,
            avg_response_time: mean_duration(self.total_response_time, lookups),
        }
    }
}

/// Per-prefix metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    service: &'static str,
    entries: RwLock<HashMap<String, Accumulator>>,
}

impl MetricsRegistry {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_hit(&self, prefix: &str, elapsed: Duration) {
        self.record(prefix, true, elapsed);
    }

    pub fn record_miss(&self, prefix: &str, elapsed: Duration) {
        self.record(prefix, false, elapsed);
    }

    fn record(&self, prefix: &str, hit: bool, elapsed: Duration) {
        let outcome = if hit { "hit" } else { "miss" };
        counter!(
            "cache_layer_domain_lookups_total",
            "service" => self.service,
            "prefix" => prefix.to_string(),
            "outcome" => outcome
        )
        .increment(1);

        let mut entries = self.entries.write();
        let entry = entries.entry(prefix.to_string()).or_default();
        if hit {
            entry.hits += 1;
        } else {
            entry.misses += 1;
        }
        entry.total_response_time = entry.total_response_time.saturating_add(elapsed);
    }

    pub fn get(&self, prefix: &str) -> Option<CacheMetrics> {
        self.entries.read().get(prefix).map(Accumulator::snapshot)
    }

    pub fn snapshot(&self) -> HashMap<String, CacheMetrics> {
        self.entries
            .read()
            .iter()
            .map(|(prefix, acc)| (prefix.clone(), acc.snapshot()))
            .collect()
    }

    pub fn reset(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let registry = MetricsRegistry::new("inventory");
        for _ in 0..7 {
            registry.record_hit("inventory", Duration::from_millis(2));
        }
        for _ in 0..3 {
            registry.record_miss("inventory", Duration::from_millis(12));
        }

        let metrics = registry.get("inventory").unwrap();
        assert_eq!(metrics.hits, 7);
        assert_eq!(metrics.misses, 3);
        assert!((metrics.hit_rate - 0.7).abs() < f64::EPSILON);
        assert_eq!(metrics.avg_response_time, Duration::from_millis(5));
    }

    #[test]
    fn test_prefixes_are_independent_and_reset() {
        let registry = MetricsRegistry::new("transfers");
        registry.record_hit("transfers", Duration::ZERO);
        registry.record_miss("inventory", Duration::ZERO);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["transfers"].hit_rate, 1.0);
        assert_eq!(snapshot["inventory"].hit_rate, 0.0);

        registry.reset();
        assert!(registry.get("transfers").is_none());
    }
}
