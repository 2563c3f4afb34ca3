//! # Predictive Cache Warming
//!
//! Runs a service's warming pass once after an initial delay and then on a
//! fixed interval. The task holds only a weak reference to the service, so
//! dropping the service ends the task.

use crate::core::config::task_period;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmingConfig {
    pub enabled: bool,

    /// Delay before the first pass
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(30),
            interval: Duration::from_secs(600),
        }
    }
}

/// Result of one warming pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmingOutcome {
    /// Keys considered
    pub attempted: usize,
    /// Keys that were absent and got populated
    pub populated: usize,
    /// Keys whose loader failed
    pub failed: usize,
}

impl WarmingOutcome {
    pub fn merge(&mut self, other: WarmingOutcome) {
        self.attempted += other.attempted;
        self.populated += other.populated;
        self.failed += other.failed;
    }
}

/// A service that can pre-populate its cache
#[async_trait]
pub trait Warmable: Send + Sync + 'static {
    fn warming_name(&self) -> &'static str;

    /// Populate absent popular keys; loader failures are logged, not returned
    async fn warm(&self) -> WarmingOutcome;
}

/// Handle on a running warming schedule
pub struct WarmingTask {
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WarmingTask {
    /// Start the schedule; `None` when warming is disabled
    pub fn spawn<W: Warmable>(target: &Arc<W>, config: &WarmingConfig) -> Option<Self> {
        if !config.enabled {
            debug!("Cache warming disabled for {}", target.warming_name());
            return None;
        }

        let token = CancellationToken::new();
        let weak: Weak<W> = Arc::downgrade(target);
        let initial_delay = config.initial_delay;
        let period = task_period("Cache warming", config.interval, WarmingConfig::default().interval);
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return,
                _ = sleep(initial_delay) => {}
            }
            if !run_pass(&weak).await {
                return;
            }

            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if !run_pass(&weak).await {
                            break;
                        }
                    }
                }
            }
        });

        Some(Self {
            token,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for WarmingTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Returns `false` once the service is gone
async fn run_pass<W: Warmable>(weak: &Weak<W>) -> bool {
    let Some(target) = weak.upgrade() else {
        return false;
    };

    let started = Instant::now();
    let outcome = target.warm().await;
    info!(
        service = target.warming_name(),
        attempted = outcome.attempted,
        populated = outcome.populated,
        failed = outcome.failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Cache warming pass finished"
    );
    true
}
