//! Circuit breaker for risky outbound operations.
//!
//! Closed -> Open after `failure_threshold` consecutive failures,
//! Open -> HalfOpen once `reset_timeout` has elapsed since the last
//! failure, HalfOpen -> Closed on the first success.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Marker error returned while the circuit is open. Callers downcast to
/// distinguish a short-circuit from a real failure of the wrapped call.
#[derive(Debug)]
pub struct CircuitOpen;

impl std::fmt::Display for CircuitOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("circuit is open")
    }
}

impl std::error::Error for CircuitOpen {}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Runs the wrapped operation unless the circuit is open. Failures of
    /// the operation are re-raised unchanged.
    pub async fn execute<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.try_enter()?;
        match fut.await {
            Ok(v) => {
                self.record_success();
                Ok(v)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    fn try_enter(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let elapsed_ok = inner
                .last_failure
                .map(|t| t.elapsed() >= self.reset_timeout)
                .unwrap_or(true);
            if elapsed_ok {
                inner.state = CircuitState::HalfOpen;
                info!("Circuit transitioning to HALF_OPEN");
            } else {
                return Err(CircuitOpen.into());
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.failure_count = 0;
            info!("Circuit CLOSED");
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen || inner.failure_count >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!("Circuit OPEN after {} failures", inner.failure_count);
            }
            inner.state = CircuitState::Open;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn failing() -> Result<()> {
        Err(anyhow::anyhow!("boom"))
    }

    async fn succeeding() -> Result<u32> {
        Ok(7)
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(breaker.execute(failing()).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.execute(succeeding()).await.unwrap_err();
        assert!(err.downcast_ref::<CircuitOpen>().is_some());
    }

    #[tokio::test]
    async fn test_wrapped_error_passes_through_unchanged() {
        let breaker = CircuitBreaker::default();
        let err = breaker.execute(failing()).await.unwrap_err();
        assert!(err.downcast_ref::<CircuitOpen>().is_none());
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        for _ in 0..2 {
            let _ = breaker.execute(failing()).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.execute(succeeding()).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));
        for _ in 0..2 {
            let _ = breaker.execute(failing()).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        // first failure in half-open re-opens immediately
        let _ = breaker.execute(failing()).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
