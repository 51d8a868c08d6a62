//! End-to-end flows over the in-process pipeline components: debounced
//! fan-out with a live flusher, rate-limit adaptation under a throttle
//! burst, circuit recovery, and tier round-trips.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use marketflow_backend::broker::FanOutBroker;
use marketflow_backend::limits::{AdaptiveRateLimiter, CircuitBreaker, CircuitState};
use marketflow_backend::policy::{CapabilityProfile, Credentials};

fn drain(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

#[tokio::test]
async fn debounced_burst_delivers_only_the_last_message() {
    let broker = FanOutBroker::new(50, 25);
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(broker.clone().run_flusher(stop_rx));

    let mut client = broker.connect("ETHUSDT");
    // hello frame
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(drain(&mut client.rx).len(), 1);

    broker.broadcast("ETHUSDT", json!({"body": "A"}), 25);
    broker.broadcast("ETHUSDT", json!({"body": "B"}), 25);
    broker.broadcast("ETHUSDT", json!({"body": "C"}), 25);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let frames = drain(&mut client.rx);
    assert_eq!(frames.len(), 1, "burst must coalesce to a single frame");
    let frame: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(frame["body"], "C");

    let metrics = broker.metrics();
    assert_eq!(metrics.messages_queued, 3);
    assert_eq!(metrics.messages_sent, 1);

    let _ = stop_tx.send(true);
}

#[tokio::test]
async fn fanout_metrics_track_multiple_subscribers() {
    let broker = FanOutBroker::new(20, 25);
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(broker.clone().run_flusher(stop_rx));

    let mut a = broker.connect("BTCUSDT");
    let mut b = broker.connect("BTCUSDT");
    tokio::time::sleep(Duration::from_millis(10)).await;
    drain(&mut a.rx);
    drain(&mut b.rx);

    broker.broadcast("BTCUSDT", json!({"seq": 1}), 25);
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(drain(&mut a.rx).len(), 1);
    assert_eq!(drain(&mut b.rx).len(), 1);

    let metrics = broker.metrics();
    assert_eq!(metrics.connections_total, 2);
    assert_eq!(metrics.total_connections, 2);
    assert_eq!(metrics.active_symbols, 1);

    broker.disconnect("BTCUSDT", a.id);
    broker.disconnect("BTCUSDT", b.id);
    assert_eq!(broker.metrics().active_symbols, 0);

    let _ = stop_tx.send(true);
}

#[test]
fn throttle_then_recovery_walks_the_rate_back() {
    let limiter = AdaptiveRateLimiter::new("adaptation", 8.0);

    // one throttle signal halves the rate and doubles the back-off
    limiter.report_error("HTTP 429: too many requests");
    let stats = limiter.stats();
    assert_eq!(stats.current_rps, 4.0);
    assert_eq!(stats.backoff_multiplier, 2.0);

    // twenty successes soften the back-off
    for _ in 0..20 {
        limiter.report_success();
    }
    assert!(limiter.stats().backoff_multiplier <= 1.8);

    // fifty total successes begin raising the rate again, bounded above
    for _ in 0..30 {
        limiter.report_success();
    }
    let stats = limiter.stats();
    assert!(stats.current_rps >= 4.2);
    assert!(stats.current_rps <= 12.0);
}

#[tokio::test]
async fn circuit_trips_then_recovers_through_half_open() {
    let breaker = CircuitBreaker::new(5, Duration::from_millis(50));

    for _ in 0..5 {
        let _ = breaker
            .execute(async { Err::<(), _>(anyhow::anyhow!("connect refused")) })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // while open every call short-circuits
    let err = breaker
        .execute(async { Ok::<_, anyhow::Error>(1u32) })
        .await
        .unwrap_err();
    assert!(err
        .downcast_ref::<marketflow_backend::limits::CircuitOpen>()
        .is_some());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let value = breaker
        .execute(async { Ok::<_, anyhow::Error>(42u32) })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn tier_round_trip_restores_identical_profile() {
    let public = CapabilityProfile::for_credentials(&Credentials::public());

    let privileged_creds = Credentials {
        api_key: "bg_0123456789".to_string(),
        secret_key: "0123456789abcdef".to_string(),
        passphrase: "pass".to_string(),
    };
    let privileged = CapabilityProfile::for_credentials(&privileged_creds);
    assert_ne!(public, privileged);
    assert_eq!(privileged.max_rps, 120.0);
    assert_eq!(privileged.max_symbols_per_group, 100);
    assert_eq!(privileged.markets.len(), 4);
    assert!(privileged.book_channel);

    // back to public: profile is byte-identical to the pre-update state
    let public_again = CapabilityProfile::for_credentials(&Credentials::public());
    assert_eq!(public, public_again);
    assert_eq!(public.max_rps, 8.0);
    assert_eq!(public.max_symbols_per_group, 10);
}

#[tokio::test]
async fn acquire_is_non_blocking_within_burst() {
    let limiter = Arc::new(AdaptiveRateLimiter::new("burst", 100.0));

    let start = std::time::Instant::now();
    for _ in 0..5 {
        limiter.acquire().await;
    }
    // five acquisitions fit inside the burst capacity without waiting
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(limiter.stats().total_requests, 5);
}
