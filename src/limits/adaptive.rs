//! Adaptive per-caller rate limiting.
//!
//! Token bucket with continuous refill, a multiplicative back-off floor
//! after errors, and feedback-driven rate adaptation. Throttle signals
//! from the venue halve the rate and double the back-off; sustained
//! success walks both back toward baseline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

/// Burst capacity of the bucket.
const MAX_BURST: f64 = 10.0;
/// Longest single suspension inside `acquire`.
const MAX_WAIT: Duration = Duration::from_secs(5);

const THROTTLE_SIGNALS: [&str; 4] = ["rate limit", "too many requests", "429", "throttle"];

/// Read-only snapshot of one limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub name: String,
    pub base_rps: f64,
    pub current_rps: f64,
    pub backoff_multiplier: f64,
    pub bucket_tokens: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub throttled_requests: u64,
    pub success_rate_percent: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

struct LimiterState {
    base_rps: f64,
    current_rps: f64,
    tokens: f64,
    last_refill: Instant,
    last_request: Option<Instant>,
    backoff_multiplier: f64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    throttled_requests: u64,
}

impl LimiterState {
    fn new(base_rps: f64) -> Self {
        Self {
            base_rps,
            current_rps: base_rps,
            tokens: MAX_BURST,
            last_refill: Instant::now(),
            last_request: None,
            backoff_multiplier: 1.0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            throttled_requests: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.current_rps).min(MAX_BURST);
            self.last_refill = now;
        }
    }

    /// Back-off floor: minimum interval between requests after errors.
    fn backoff_blocks(&self) -> bool {
        if self.backoff_multiplier <= 1.0 {
            return false;
        }
        match self.last_request {
            Some(last) => {
                let min_interval = (1.0 / self.current_rps) * self.backoff_multiplier;
                last.elapsed().as_secs_f64() < min_interval
            }
            None => false,
        }
    }

    /// Smallest wait that frees a token or clears the back-off floor.
    fn pending_wait(&self) -> Duration {
        let secs = if self.tokens < 1.0 {
            (1.0 - self.tokens) / self.current_rps
        } else {
            let min_interval = (1.0 / self.current_rps) * self.backoff_multiplier;
            let since_last = self
                .last_request
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(f64::MAX);
            (min_interval - since_last).max(0.0)
        };
        Duration::from_secs_f64(secs.max(0.001))
    }
}

/// One named, internally synchronized limiter. Safe for concurrent callers.
pub struct AdaptiveRateLimiter {
    name: String,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(name: impl Into<String>, base_rps: f64) -> Self {
        let name = name.into();
        info!("✅ Rate limiter '{}' initialized - base rps: {}", name, base_rps);
        Self {
            name,
            state: Mutex::new(LimiterState::new(base_rps)),
        }
    }

    /// Blocks cooperatively until one token is available, then consumes it.
    /// Never fails; throttled waits only bump a counter.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut s = self.state.lock();
                s.refill();
                if s.tokens >= 1.0 && !s.backoff_blocks() {
                    s.tokens -= 1.0;
                    s.last_request = Some(Instant::now());
                    s.total_requests += 1;
                    return;
                }
                s.throttled_requests += 1;
                s.pending_wait()
            };
            tokio::time::sleep(wait.min(MAX_WAIT)).await;
        }
    }

    pub fn report_success(&self) {
        let mut s = self.state.lock();
        s.successful_requests += 1;
        s.consecutive_successes += 1;
        s.consecutive_failures = 0;

        if s.consecutive_successes >= 20 && s.backoff_multiplier > 1.0 {
            s.backoff_multiplier = (s.backoff_multiplier * 0.9).max(1.0);
        }
        if s.consecutive_successes >= 50 && s.current_rps < s.base_rps * 1.5 {
            s.current_rps = (s.current_rps * 1.05).min(s.base_rps * 1.5);
        }
    }

    pub fn report_error(&self, detail: &str) {
        let mut s = self.state.lock();
        s.failed_requests += 1;
        s.consecutive_failures += 1;
        s.consecutive_successes = 0;

        let lower = detail.to_ascii_lowercase();
        if THROTTLE_SIGNALS.iter().any(|k| lower.contains(k)) {
            s.backoff_multiplier = (s.backoff_multiplier * 2.0).min(4.0);
            s.current_rps = (s.current_rps * 0.5).max(1.0);
            warn!(
                "⚠️  Rate limit hit for '{}' - backing off: {:.2}x, rps {:.2}",
                self.name, s.backoff_multiplier, s.current_rps
            );
        } else if s.consecutive_failures >= 5 {
            s.backoff_multiplier = (s.backoff_multiplier * 1.5).min(2.0);
            warn!(
                "⚠️  Repeated failures for '{}' - back-off {:.2}x",
                self.name, s.backoff_multiplier
            );
        }
    }

    /// Hot-replaces the target rate. Bucket tokens stay clamped to burst.
    pub fn update_base_rate(&self, new_rps: f64) {
        let mut s = self.state.lock();
        if (new_rps - s.base_rps).abs() < f64::EPSILON {
            return;
        }
        let old = s.base_rps;
        s.base_rps = new_rps;
        s.current_rps = new_rps;
        s.tokens = s.tokens.min(MAX_BURST);
        info!(
            "📈 Rate limit updated for '{}': {} -> {} rps",
            self.name, old, new_rps
        );
    }

    pub fn stats(&self) -> RateLimiterStats {
        let mut s = self.state.lock();
        s.refill();
        let success_rate = if s.total_requests > 0 {
            (s.successful_requests as f64 / s.total_requests as f64) * 100.0
        } else {
            100.0
        };
        RateLimiterStats {
            name: self.name.clone(),
            base_rps: s.base_rps,
            current_rps: s.current_rps,
            backoff_multiplier: s.backoff_multiplier,
            bucket_tokens: s.tokens,
            total_requests: s.total_requests,
            successful_requests: s.successful_requests,
            failed_requests: s.failed_requests,
            throttled_requests: s.throttled_requests,
            success_rate_percent: success_rate,
            consecutive_successes: s.consecutive_successes,
            consecutive_failures: s.consecutive_failures,
        }
    }
}

/// Owns every named limiter for the process. Lives on the application
/// context; child tasks receive handles rather than reaching for globals.
#[derive(Default)]
pub struct RateLimiterRegistry {
    limiters: RwLock<HashMap<String, Arc<AdaptiveRateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create a limiter for a named caller.
    pub fn get(&self, name: &str, base_rps: f64) -> Arc<AdaptiveRateLimiter> {
        if let Some(l) = self.limiters.read().get(name) {
            return l.clone();
        }
        let mut limiters = self.limiters.write();
        limiters
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AdaptiveRateLimiter::new(name, base_rps)))
            .clone()
    }

    pub fn all_stats(&self) -> Vec<RateLimiterStats> {
        self.limiters.read().values().map(|l| l.stats()).collect()
    }

    /// Aggregate (total, successful, failed) request counts across limiters.
    pub fn aggregate(&self) -> (u64, u64, u64) {
        let mut total = 0u64;
        let mut ok = 0u64;
        let mut failed = 0u64;
        for l in self.limiters.read().values() {
            let s = l.stats();
            total += s.total_requests;
            ok += s.successful_requests;
            failed += s.failed_requests;
        }
        (total, ok, failed)
    }

    /// Applied on tier change so every bucket picks up the new cap.
    pub fn update_base_rate_all(&self, new_rps: f64) {
        for l in self.limiters.read().values() {
            l.update_base_rate(new_rps);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_error_halves_rate_and_doubles_backoff() {
        let limiter = AdaptiveRateLimiter::new("test", 8.0);
        limiter.report_error("HTTP 429 Too Many Requests");

        let stats = limiter.stats();
        assert_eq!(stats.current_rps, 4.0);
        assert_eq!(stats.backoff_multiplier, 2.0);
        assert_eq!(stats.consecutive_successes, 0);
    }

    #[test]
    fn test_success_streak_recovers_backoff_then_rate() {
        let limiter = AdaptiveRateLimiter::new("test", 8.0);
        limiter.report_error("rate limit exceeded");

        for _ in 0..20 {
            limiter.report_success();
        }
        let stats = limiter.stats();
        assert!(stats.backoff_multiplier <= 1.8);

        for _ in 0..30 {
            limiter.report_success();
        }
        let stats = limiter.stats();
        assert!(stats.current_rps >= 4.2);
        assert!(stats.current_rps <= 12.0);
    }

    #[test]
    fn test_rate_floor_and_ceiling() {
        let limiter = AdaptiveRateLimiter::new("test", 8.0);
        for _ in 0..10 {
            limiter.report_error("throttle");
        }
        let stats = limiter.stats();
        assert!(stats.current_rps >= 1.0);
        assert_eq!(stats.backoff_multiplier, 4.0);

        for _ in 0..10_000 {
            limiter.report_success();
        }
        let stats = limiter.stats();
        assert!(stats.current_rps <= 8.0 * 1.5 + f64::EPSILON);
    }

    #[test]
    fn test_non_throttle_errors_escalate_slowly() {
        let limiter = AdaptiveRateLimiter::new("test", 8.0);
        for _ in 0..4 {
            limiter.report_error("connection reset by peer");
        }
        assert_eq!(limiter.stats().backoff_multiplier, 1.0);

        limiter.report_error("connection reset by peer");
        let stats = limiter.stats();
        assert_eq!(stats.backoff_multiplier, 1.5);
        // non-throttle path never reduces the rate itself
        assert_eq!(stats.current_rps, 8.0);
    }

    #[test]
    fn test_update_base_rate_clamps_tokens() {
        let limiter = AdaptiveRateLimiter::new("test", 8.0);
        limiter.update_base_rate(120.0);
        let stats = limiter.stats();
        assert_eq!(stats.base_rps, 120.0);
        assert_eq!(stats.current_rps, 120.0);
        assert!(stats.bucket_tokens <= MAX_BURST);
    }

    #[tokio::test]
    async fn test_acquire_consumes_tokens_and_counts() {
        let limiter = AdaptiveRateLimiter::new("test", 1000.0);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 5);
        assert!(stats.bucket_tokens >= 0.0);
        assert!(stats.bucket_tokens <= MAX_BURST);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = RateLimiterRegistry::new();
        let a = registry.get("ws-spot-0", 8.0);
        let b = registry.get("ws-spot-0", 8.0);
        assert!(Arc::ptr_eq(&a, &b));

        a.report_success();
        let (total, ok, failed) = registry.aggregate();
        assert_eq!((total, ok, failed), (0, 1, 0));
    }

    #[test]
    fn test_registry_update_all() {
        let registry = RateLimiterRegistry::new();
        registry.get("a", 8.0);
        registry.get("b", 8.0);
        registry.update_base_rate_all(120.0);
        for s in registry.all_stats() {
            assert_eq!(s.base_rps, 120.0);
        }
    }
}
