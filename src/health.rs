//! Health monitoring and failover.
//!
//! A periodic sweep probes the cache sink, the venue catalog and the
//! analytical store, folds in aggregate rate-limiter stats, and latches
//! the failover flag when a critical dependency is down. Upstream
//! sessions read the latch before starting new work; the latch clears
//! automatically once every condition is healthy again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::limits::RateLimiterRegistry;
use crate::storage::{AnalyticsSink, StreamSink};
use crate::upstream::CatalogClient;

const DEGRADED_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const MIN_THROUGHPUT: f64 = 0.5;
const MAX_ERROR_RATE: f64 = 0.25;

/// Process-wide flag suspending new upstream work. Written only by the
/// health supervisor, read by every session.
pub struct FailoverLatch {
    active: AtomicBool,
    reason: Mutex<Option<String>>,
    since: Mutex<Option<Instant>>,
}

impl FailoverLatch {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            reason: Mutex::new(None),
            since: Mutex::new(None),
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn engage(&self, reason: String) {
        if !self.active.swap(true, Ordering::AcqRel) {
            warn!("🔴 Failover engaged: {}", reason);
            *self.since.lock() = Some(Instant::now());
        }
        *self.reason.lock() = Some(reason);
    }

    pub fn clear(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            info!("🟢 Failover cleared - system back to normal");
            *self.since.lock() = Some(Instant::now());
            *self.reason.lock() = None;
        }
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

impl Default for FailoverLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub venue_api: bool,
    pub cache: bool,
    pub analytics: bool,
    pub throughput: f64,
    pub error_rate: f64,
    pub failover_active: bool,
    pub reason: Option<String>,
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn initial() -> Self {
        Self {
            venue_api: true,
            cache: true,
            analytics: true,
            throughput: 1.0,
            error_rate: 0.0,
            failover_active: false,
            reason: None,
            status: HealthStatus::Healthy,
            checked_at: Utc::now(),
        }
    }
}

pub struct HealthMonitor {
    sink: Arc<StreamSink>,
    analytics: Arc<AnalyticsSink>,
    catalog: Arc<CatalogClient>,
    limiters: Arc<RateLimiterRegistry>,
    latch: Arc<FailoverLatch>,
    interval: Duration,
    snapshot: RwLock<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(
        sink: Arc<StreamSink>,
        analytics: Arc<AnalyticsSink>,
        catalog: Arc<CatalogClient>,
        limiters: Arc<RateLimiterRegistry>,
        latch: Arc<FailoverLatch>,
        interval_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            analytics,
            catalog,
            limiters,
            latch,
            interval: Duration::from_secs(interval_secs),
            snapshot: RwLock::new(HealthSnapshot::initial()),
        })
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot.read().clone()
    }

    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!(
            "🏥 Health monitoring started (interval {}s)",
            self.interval.as_secs()
        );
        loop {
            let status = self.sweep().await;
            let delay = if status == HealthStatus::Healthy {
                self.interval
            } else {
                DEGRADED_SWEEP_INTERVAL
            };

            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("🏥 Health monitoring stopped");
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn sweep(&self) -> HealthStatus {
        let cache = self.sink.ping().await;
        let venue_api = self.catalog.probe().await.is_ok();
        let analytics = self.analytics.ping().await;

        let (total, ok, _failed) = self.limiters.aggregate();
        let throughput = if total > 0 {
            ok as f64 / total as f64
        } else {
            1.0
        };
        let error_rate = 1.0 - throughput;

        let mut reasons: Vec<String> = Vec::new();
        if !cache {
            reasons.push("cache sink ping failed".to_string());
        }
        if !venue_api {
            reasons.push("venue catalog unreachable".to_string());
        }
        if throughput < MIN_THROUGHPUT {
            reasons.push(format!("throughput too low: {:.1}%", throughput * 100.0));
        }
        if error_rate > MAX_ERROR_RATE {
            reasons.push(format!("error rate too high: {:.1}%", error_rate * 100.0));
        }

        if reasons.is_empty() {
            self.latch.clear();
        } else {
            self.latch.engage(reasons.join("; "));
        }

        let failover_active = self.latch.is_active();
        let status = if failover_active {
            HealthStatus::Critical
        } else if venue_api && cache && analytics && throughput >= 0.7 && error_rate <= 0.10 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        let snap = HealthSnapshot {
            venue_api,
            cache,
            analytics,
            throughput,
            error_rate,
            failover_active,
            reason: self.latch.reason(),
            status,
            checked_at: Utc::now(),
        };
        *self.snapshot.write() = snap;
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_engage_clear() {
        let latch = FailoverLatch::new();
        assert!(!latch.is_active());

        latch.engage("cache sink ping failed".to_string());
        assert!(latch.is_active());
        assert_eq!(latch.reason().as_deref(), Some("cache sink ping failed"));

        // engaging again just refreshes the reason
        latch.engage("venue catalog unreachable".to_string());
        assert!(latch.is_active());

        latch.clear();
        assert!(!latch.is_active());
        assert_eq!(latch.reason(), None);
    }

    #[test]
    fn test_clear_when_inactive_is_noop() {
        let latch = FailoverLatch::new();
        latch.clear();
        assert!(!latch.is_active());
    }
}
