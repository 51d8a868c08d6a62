//! Streaming session management.
//!
//! Fault-tolerant reconnect discipline for the per-group venue sessions:
//! - State machine with well-defined transitions
//! - Exponential backoff with jitter (thundering herd prevention)
//! - Application-level heartbeat (ping/pong + frame staleness)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::info;

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Parked: the failover latch is set, no upstream work.
    Idle,
    /// TCP + TLS + WebSocket upgrade in progress
    Connecting,
    /// Socket open, subscription envelope sent, waiting for confirmation
    Subscribing,
    /// Actively receiving market data
    Streaming,
    /// Graceful close in progress, draining the socket
    Draining,
    /// Connection lost, waiting for the backoff timer
    Reconnecting,
    /// Stopped for good
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Subscribing => write!(f, "SUBSCRIBING"),
            Self::Streaming => write!(f, "STREAMING"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Reconnecting => write!(f, "RECONNECTING"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Reason for a state transition (for logging/metrics).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    FailoverActive,
    ConnectSuccess,
    SubscribeAck,
    PongTimeout,
    IdleTimeout,
    ServerClose,
    SocketError,
    Stopped,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::FailoverActive => write!(f, "failover_active"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::SubscribeAck => write!(f, "subscribe_ack"),
            Self::PongTimeout => write!(f, "pong_timeout"),
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::ServerClose => write!(f, "server_close"),
            Self::SocketError => write!(f, "network_error"),
            Self::Stopped => write!(f, "shutdown"),
        }
    }
}

const BACKOFF_CAP_SECS: u64 = 60;
const JITTER_FACTOR: f64 = 0.25;

/// `min(2^n, 60)` seconds with jitter; `n` resets on a successful stream.
#[derive(Debug)]
pub struct BackoffCalculator {
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(12345),
        }
    }

    /// Fast PRNG for jitter (xorshift64)
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let base = 2f64
            .powi(self.attempt.min(30) as i32)
            .min(BACKOFF_CAP_SECS as f64);
        let jitter = (self.next_random() * 2.0 - 1.0) * base * JITTER_FACTOR;
        let secs = (base + jitter).clamp(0.5, BACKOFF_CAP_SECS as f64);

        self.attempt += 1;
        Duration::from_secs_f64(secs)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for BackoffCalculator {
    fn default() -> Self {
        Self::new()
    }
}

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a heartbeat check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    IdleTimeout,
}

/// Application-level heartbeat: ping every 20 s, pong within 10 s, and no
/// frame for 60 s means the session is stale.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_frame: Instant,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self {
            last_ping_sent: None,
            awaiting_pong: false,
            last_frame: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.awaiting_pong = false;
        self.last_frame = Instant::now();
    }

    #[inline]
    pub fn record_frame(&mut self) {
        self.last_frame = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    pub fn record_pong_received(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if self.awaiting_pong {
            if let Some(ping_time) = self.last_ping_sent {
                if now.duration_since(ping_time) > PONG_TIMEOUT {
                    return HeartbeatAction::PongTimeout;
                }
            }
        }

        if now.duration_since(self.last_frame) > FRAME_IDLE_TIMEOUT {
            return HeartbeatAction::IdleTimeout;
        }

        let should_ping = match self.last_ping_sent {
            None => true,
            Some(ping_time) => now.duration_since(ping_time) > PING_INTERVAL,
        };
        if should_ping && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session counters.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub reconnections: AtomicU64,
    pub frames_processed: AtomicU64,
    pub trades_published: AtomicU64,
    pub trades_deduplicated: AtomicU64,
    pub books_stored: AtomicU64,
    pub decode_errors: AtomicU64,
    pub upstream_errors: AtomicU64,
}

impl SessionMetrics {
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} frames={} published={} deduped={} books={} decode_errors={} upstream_errors={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.frames_processed.load(Ordering::Relaxed),
            self.trades_published.load(Ordering::Relaxed),
            self.trades_deduplicated.load(Ordering::Relaxed),
            self.books_stored.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.upstream_errors.load(Ordering::Relaxed),
        )
    }
}

/// Coordinates state, backoff, heartbeat and metrics for one session.
pub struct SessionManager {
    group_id: String,
    state: RwLock<SessionState>,
    backoff: RwLock<BackoffCalculator>,
    heartbeat: RwLock<HeartbeatMonitor>,
    pub metrics: SessionMetrics,
}

impl SessionManager {
    pub fn new(group_id: String) -> Self {
        Self {
            group_id,
            state: RwLock::new(SessionState::Idle),
            backoff: RwLock::new(BackoffCalculator::new()),
            heartbeat: RwLock::new(HeartbeatMonitor::new()),
            metrics: SessionMetrics::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn transition(&self, new_state: SessionState, reason: TransitionReason) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }

        match new_state {
            SessionState::Connecting => {
                self.metrics
                    .connections_attempted
                    .fetch_add(1, Ordering::Relaxed);
            }
            SessionState::Streaming => {
                self.metrics
                    .connections_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                self.backoff.write().reset();
                self.heartbeat.write().reset();
            }
            SessionState::Reconnecting => {
                self.metrics.reconnections.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        info!(
            group = %self.group_id,
            from = %old_state,
            to = %new_state,
            reason = %reason,
            "session_transition"
        );
    }

    pub fn next_backoff(&self) -> Duration {
        self.backoff.write().next_backoff()
    }

    #[inline]
    pub fn record_frame(&self) {
        self.metrics.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.heartbeat.write().record_frame();
    }

    pub fn record_ping_sent(&self) {
        self.heartbeat.write().record_ping_sent();
    }

    pub fn record_pong_received(&self) {
        self.heartbeat.write().record_pong_received();
    }

    pub fn check_heartbeat(&self) -> HeartbeatAction {
        self.heartbeat.write().check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = BackoffCalculator::new();

        let d1 = backoff.next_backoff();
        assert!(d1.as_secs_f64() >= 0.5 && d1.as_secs_f64() <= 1.25);

        let d2 = backoff.next_backoff();
        assert!(d2.as_secs_f64() >= 1.5 && d2.as_secs_f64() <= 2.5);

        for _ in 0..20 {
            let d = backoff.next_backoff();
            assert!(d.as_secs_f64() <= 60.0);
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = BackoffCalculator::new();
        for _ in 0..8 {
            backoff.next_backoff();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        let d = backoff.next_backoff();
        assert!(d.as_secs_f64() <= 1.25);
    }

    #[test]
    fn test_heartbeat_wants_initial_ping() {
        let mut monitor = HeartbeatMonitor::new();
        assert_eq!(monitor.check(), HeartbeatAction::SendPing);

        monitor.record_ping_sent();
        assert_eq!(monitor.check(), HeartbeatAction::Ok);

        monitor.record_pong_received();
        assert_eq!(monitor.check(), HeartbeatAction::Ok);
    }

    #[test]
    fn test_session_manager_transitions_and_metrics() {
        let manager = SessionManager::new("spot-g0".to_string());
        assert_eq!(manager.state(), SessionState::Idle);

        manager.transition(SessionState::Connecting, TransitionReason::Started);
        manager.transition(SessionState::Subscribing, TransitionReason::ConnectSuccess);
        manager.transition(SessionState::Streaming, TransitionReason::SubscribeAck);
        assert_eq!(manager.state(), SessionState::Streaming);

        assert_eq!(
            manager
                .metrics
                .connections_attempted
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(
            manager
                .metrics
                .connections_succeeded
                .load(Ordering::Relaxed),
            1
        );

        manager.transition(SessionState::Reconnecting, TransitionReason::SocketError);
        assert_eq!(manager.metrics.reconnections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_same_state_transition_is_noop() {
        let manager = SessionManager::new("spot-g0".to_string());
        manager.transition(SessionState::Connecting, TransitionReason::Started);
        manager.transition(SessionState::Connecting, TransitionReason::Started);
        assert_eq!(
            manager
                .metrics
                .connections_attempted
                .load(Ordering::Relaxed),
            1
        );
    }
}
