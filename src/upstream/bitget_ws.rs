//! Venue streaming sessions.
//!
//! One long-lived WebSocket session per subscription group. A session
//! batches its subscriptions into a single envelope, classifies incoming
//! frames, publishes parsed trades into the stream sink and broadcasts
//! first publications to the fan-out broker. The supervisor owns the
//! session tasks and rebuilds them when the working set or the
//! capability profile changes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::broker::{trade_frame, FanOutBroker};
use crate::config::{BitgetConfig, MarketEndpoint};
use crate::health::FailoverLatch;
use crate::limits::{AdaptiveRateLimiter, RateLimiterRegistry};
use crate::models::{BookLevel, BookUpdate, Side, Trade};
use crate::policy::CapabilityProfile;
use crate::storage::StreamSink;
use crate::symbols::{SubscriptionGroup, SymbolManager};
use crate::upstream::session::{
    HeartbeatAction, SessionManager, SessionState, TransitionReason,
};

const TRADE_CHANNEL: &str = "trade";
const BOOK_CHANNEL: &str = "books50";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const FAILOVER_POLL: Duration = Duration::from_secs(5);

enum SessionExit {
    Stopped,
    Lost(TransitionReason),
}

/// One streaming session for one subscription group.
pub struct UpstreamSession {
    group: SubscriptionGroup,
    endpoint: MarketEndpoint,
    subscribe_books: bool,
    symbols: HashSet<String>,
    sink: Arc<StreamSink>,
    broker: Arc<FanOutBroker>,
    limiter: Arc<AdaptiveRateLimiter>,
    failover: Arc<FailoverLatch>,
    pub manager: SessionManager,
}

impl UpstreamSession {
    pub fn new(
        group: SubscriptionGroup,
        subscribe_books: bool,
        sink: Arc<StreamSink>,
        broker: Arc<FanOutBroker>,
        limiter: Arc<AdaptiveRateLimiter>,
        failover: Arc<FailoverLatch>,
    ) -> Arc<Self> {
        let endpoint = BitgetConfig::endpoint(group.market);
        let symbols = group.symbols.iter().cloned().collect();
        let manager = SessionManager::new(group.id.clone());
        Arc::new(Self {
            group,
            endpoint,
            subscribe_books,
            symbols,
            sink,
            broker,
            limiter,
            failover,
            manager,
        })
    }

    pub async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!(
            "🔌 Upstream session {} starting ({} symbols, books={})",
            self.group.id,
            self.group.symbols.len(),
            self.subscribe_books
        );

        loop {
            if *stop_rx.borrow() {
                self.manager
                    .transition(SessionState::Terminated, TransitionReason::Stopped);
                return;
            }

            // the failover latch parks the session before any upstream work
            if self.failover.is_active() {
                self.manager
                    .transition(SessionState::Idle, TransitionReason::FailoverActive);
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = tokio::time::sleep(FAILOVER_POLL) => {}
                }
                continue;
            }

            self.manager
                .transition(SessionState::Connecting, TransitionReason::Started);

            let exit = match self.connect_and_stream(&mut stop_rx).await {
                Ok(exit) => exit,
                Err(e) => {
                    self.limiter.report_error(&e.to_string());
                    warn!(group = %self.group.id, error = %e, "session error");
                    SessionExit::Lost(TransitionReason::SocketError)
                }
            };

            match exit {
                SessionExit::Stopped => {
                    self.manager
                        .transition(SessionState::Terminated, TransitionReason::Stopped);
                    info!(
                        "🛑 Session {} terminated ({})",
                        self.group.id,
                        self.manager.metrics.summary()
                    );
                    return;
                }
                SessionExit::Lost(reason) => {
                    self.manager.transition(SessionState::Reconnecting, reason);
                    let backoff = self.manager.next_backoff();
                    tokio::select! {
                        _ = stop_rx.changed() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<SessionExit> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.endpoint.ws_url))
            .await
            .map_err(|_| anyhow::anyhow!("connect timeout ({})", self.endpoint.ws_url))?
            .with_context(|| format!("connect {}", self.endpoint.ws_url))?;

        self.manager
            .transition(SessionState::Subscribing, TransitionReason::ConnectSuccess);

        let (mut write, mut read) = ws_stream.split();

        // one batched envelope for the whole group, resent on reconnect
        self.limiter.acquire().await;
        let envelope = self.subscribe_envelope();
        write
            .send(Message::Text(envelope.to_string()))
            .await
            .context("send subscribe envelope")?;
        self.limiter.report_success();

        let mut heartbeat = tokio::time::interval(Duration::from_secs(1));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        self.manager.transition(SessionState::Draining, TransitionReason::Stopped);
                        let _ = write.send(Message::Close(None)).await;
                        let _ = tokio::time::timeout(DRAIN_TIMEOUT, async {
                            while let Some(frame) = read.next().await {
                                if matches!(frame, Ok(Message::Close(_)) | Err(_)) {
                                    break;
                                }
                            }
                        })
                        .await;
                        return Ok(SessionExit::Stopped);
                    }
                }
                _ = heartbeat.tick() => {
                    match self.manager.check_heartbeat() {
                        HeartbeatAction::Ok => {}
                        HeartbeatAction::SendPing => {
                            self.limiter.acquire().await;
                            if write.send(Message::Text("ping".to_string())).await.is_err() {
                                return Ok(SessionExit::Lost(TransitionReason::SocketError));
                            }
                            self.manager.record_ping_sent();
                        }
                        HeartbeatAction::PongTimeout => {
                            return Ok(SessionExit::Lost(TransitionReason::PongTimeout));
                        }
                        HeartbeatAction::IdleTimeout => {
                            return Ok(SessionExit::Lost(TransitionReason::IdleTimeout));
                        }
                    }
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(SessionExit::Lost(TransitionReason::ServerClose));
                    };
                    match frame {
                        Ok(Message::Text(text)) => self.handle_text(&text).await,
                        Ok(Message::Ping(payload)) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Pong(_)) => self.manager.record_pong_received(),
                        Ok(Message::Close(frame)) => {
                            debug!(group = %self.group.id, ?frame, "server close");
                            return Ok(SessionExit::Lost(TransitionReason::ServerClose));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.limiter.report_error(&e.to_string());
                            return Ok(SessionExit::Lost(TransitionReason::SocketError));
                        }
                    }
                }
            }
        }
    }

    fn subscribe_envelope(&self) -> Value {
        build_subscribe_envelope(&self.group, &self.endpoint, self.subscribe_books)
    }

    fn ensure_streaming(&self) {
        if self.manager.state() == SessionState::Subscribing {
            self.manager
                .transition(SessionState::Streaming, TransitionReason::SubscribeAck);
        }
    }

    async fn handle_text(&self, text: &str) {
        self.manager.record_frame();

        if text.eq_ignore_ascii_case("pong") {
            self.manager.record_pong_received();
            return;
        }

        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.manager
                    .metrics
                    .decode_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        };

        match msg.get("event").and_then(Value::as_str) {
            Some("subscribe") => {
                self.ensure_streaming();
                debug!(group = %self.group.id, "subscription confirmed");
                return;
            }
            Some("error") => {
                // venue errors do not tear down the socket by themselves
                let detail = msg.get("msg").and_then(Value::as_str).unwrap_or("unknown");
                self.limiter.report_error(detail);
                self.manager
                    .metrics
                    .upstream_errors
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(group = %self.group.id, "upstream error frame: {}", detail);
                return;
            }
            _ => {}
        }

        let action = msg.get("action").and_then(Value::as_str);
        if !matches!(action, Some("update") | Some("snapshot")) {
            return;
        }
        self.ensure_streaming();

        let arg = msg.get("arg").cloned().unwrap_or(Value::Null);
        let channel = arg.get("channel").and_then(Value::as_str).unwrap_or("");
        let inst_id = arg.get("instId").and_then(Value::as_str).unwrap_or("");
        let symbol = inst_id
            .strip_suffix(self.endpoint.suffix)
            .unwrap_or(inst_id)
            .to_string();

        if !self.symbols.contains(&symbol) {
            warn!(group = %self.group.id, symbol = %symbol, "frame for unknown symbol dropped");
            return;
        }

        let data = msg.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
        match channel {
            TRADE_CHANNEL => {
                for element in &data {
                    match parse_trade(element, &symbol, self.group.market) {
                        Some(trade) => self.ingest_trade(trade).await,
                        None => {
                            self.manager
                                .metrics
                                .decode_errors
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
            }
            BOOK_CHANNEL if self.subscribe_books => {
                let snapshot = action == Some("snapshot");
                for element in &data {
                    match parse_book(element, &symbol, self.group.market, snapshot) {
                        Some(book) => {
                            if let Err(e) = self.sink.put_book(&book).await {
                                self.limiter.report_error(&e.to_string());
                                warn!(group = %self.group.id, error = %e, "book write failed");
                            } else {
                                self.manager
                                    .metrics
                                    .books_stored
                                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                        }
                        None => {
                            self.manager
                                .metrics
                                .decode_errors
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Publish first; broadcast only on first publication so replayed
    /// duplicates never reach the dashboards.
    async fn ingest_trade(&self, trade: Trade) {
        match self.sink.publish_trade(&trade).await {
            Ok(true) => {
                self.manager
                    .metrics
                    .trades_published
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.limiter.report_success();
                self.broker.broadcast(
                    &trade.symbol,
                    trade_frame(&trade),
                    self.broker.default_debounce_ms(),
                );
            }
            Ok(false) => {
                self.manager
                    .metrics
                    .trades_deduplicated
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.limiter.report_success();
            }
            Err(e) => {
                self.limiter.report_error(&e.to_string());
                warn!(group = %self.group.id, error = %e, "trade publish failed");
            }
        }
    }
}

/// One batched envelope listing the trade (and, privileged, book) channel
/// for every symbol in the group.
fn build_subscribe_envelope(
    group: &SubscriptionGroup,
    endpoint: &MarketEndpoint,
    subscribe_books: bool,
) -> Value {
    let mut args = Vec::with_capacity(group.symbols.len() * if subscribe_books { 2 } else { 1 });
    for symbol in &group.symbols {
        let inst_id = format!("{symbol}{}", endpoint.suffix);
        args.push(json!({
            "instType": endpoint.inst_type,
            "channel": TRADE_CHANNEL,
            "instId": inst_id,
        }));
        if subscribe_books {
            args.push(json!({
                "instType": endpoint.inst_type,
                "channel": BOOK_CHANNEL,
                "instId": format!("{symbol}{}", endpoint.suffix),
            }));
        }
    }
    json!({ "op": "subscribe", "args": args })
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn value_as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Trade tuple layout: `[timestamp_ms, price, size, side]`.
fn parse_trade(element: &Value, symbol: &str, market: crate::models::Market) -> Option<Trade> {
    let tuple = element.as_array()?;
    if tuple.len() < 4 {
        return None;
    }
    let ts = value_as_i64(&tuple[0])?;
    let price = value_as_f64(&tuple[1])?;
    let size = value_as_f64(&tuple[2])?;
    let side = Side::parse(tuple[3].as_str()?)?;
    if price <= 0.0 || size <= 0.0 {
        return None;
    }
    Some(Trade {
        symbol: symbol.to_string(),
        market,
        price,
        size,
        side,
        ts,
        ingested_at: Utc::now(),
    })
}

fn parse_levels(raw: Option<&Value>) -> Vec<BookLevel> {
    let mut levels = Vec::new();
    for pair in raw.and_then(Value::as_array).into_iter().flatten() {
        let Some(entry) = pair.as_array() else {
            continue;
        };
        if entry.len() < 2 {
            continue;
        }
        if let (Some(price), Some(size)) = (value_as_f64(&entry[0]), value_as_f64(&entry[1])) {
            levels.push(BookLevel { price, size });
        }
    }
    levels.truncate(50);
    levels
}

fn parse_book(
    element: &Value,
    symbol: &str,
    market: crate::models::Market,
    action_snapshot: bool,
) -> Option<BookUpdate> {
    let bids = parse_levels(element.get("bids"));
    let asks = parse_levels(element.get("asks"));
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    let ts = element
        .get("ts")
        .and_then(value_as_i64)
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let snapshot = action_snapshot
        || element
            .get("snapshot")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    Some(BookUpdate {
        symbol: symbol.to_string(),
        market,
        bids,
        asks,
        ts,
        snapshot,
    })
}

struct SessionHandle {
    group_id: String,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    session: Arc<UpstreamSession>,
}

/// Owns every live upstream session. Sessions are destroyed and recreated
/// atomically when the working set or capability profile changes.
pub struct IngestSupervisor {
    sink: Arc<StreamSink>,
    broker: Arc<FanOutBroker>,
    limiters: Arc<RateLimiterRegistry>,
    failover: Arc<FailoverLatch>,
    symbols: Arc<SymbolManager>,
    profile: Arc<ArcSwap<CapabilityProfile>>,
    sessions: tokio::sync::Mutex<Vec<SessionHandle>>,
}

impl IngestSupervisor {
    pub fn new(
        sink: Arc<StreamSink>,
        broker: Arc<FanOutBroker>,
        limiters: Arc<RateLimiterRegistry>,
        failover: Arc<FailoverLatch>,
        symbols: Arc<SymbolManager>,
        profile: Arc<ArcSwap<CapabilityProfile>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            broker,
            limiters,
            failover,
            symbols,
            profile,
            sessions: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawns one session per subscription group of the current working set.
    pub async fn start(&self) {
        let profile = self.profile.load_full();
        let groups = self.symbols.groups(profile.max_symbols_per_group);
        let mut sessions = self.sessions.lock().await;

        for group in groups {
            let limiter = self
                .limiters
                .get(&format!("ws-{}", group.id), profile.max_rps);
            let session = UpstreamSession::new(
                group.clone(),
                profile.book_channel,
                self.sink.clone(),
                self.broker.clone(),
                limiter,
                self.failover.clone(),
            );
            let (stop_tx, stop_rx) = watch::channel(false);
            let task = tokio::spawn(session.clone().run(stop_rx));
            sessions.push(SessionHandle {
                group_id: group.id,
                stop_tx,
                task,
                session,
            });
        }

        info!("✅ Ingest supervisor started {} upstream sessions", sessions.len());
    }

    /// Signals every session to drain, then waits briefly before aborting
    /// stragglers.
    pub async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        for handle in sessions.iter() {
            let _ = handle.stop_tx.send(true);
        }
        for handle in sessions.drain(..) {
            if tokio::time::timeout(Duration::from_secs(11), handle.task)
                .await
                .is_err()
            {
                warn!("session {} did not drain in time", handle.group_id);
            }
        }
    }

    /// Tears down and respawns every session so a new grouping and channel
    /// set take effect.
    pub async fn rebuild(&self) {
        info!("🔄 Rebuilding upstream sessions");
        self.stop_all().await;
        self.start().await;
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn status(&self) -> Vec<(String, String)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|h| (h.group_id.clone(), h.session.manager.state().to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Market;

    #[test]
    fn test_parse_trade_tuple() {
        let element = json!(["1700000000000", "30000.5", "0.1", "buy"]);
        let trade = parse_trade(&element, "BTCUSDT", Market::Spot).unwrap();
        assert_eq!(trade.ts, 1_700_000_000_000);
        assert_eq!(trade.price, 30000.5);
        assert_eq!(trade.size, 0.1);
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.symbol, "BTCUSDT");
    }

    #[test]
    fn test_parse_trade_numeric_fields_and_mixed_case_side() {
        let element = json!([1700000000000i64, 30000.5, 0.1, "SELL"]);
        let trade = parse_trade(&element, "BTCUSDT", Market::Usdtm).unwrap();
        assert_eq!(trade.side, Side::Sell);
        assert_eq!(trade.market, Market::Usdtm);
    }

    #[test]
    fn test_parse_trade_rejects_garbage() {
        assert!(parse_trade(&json!(["ts", "p", "s", "buy"]), "X", Market::Spot).is_none());
        assert!(parse_trade(&json!(["1", "0", "1", "buy"]), "X", Market::Spot).is_none());
        assert!(parse_trade(&json!(["1", "2", "3"]), "X", Market::Spot).is_none());
        assert!(parse_trade(&json!({"not": "an array"}), "X", Market::Spot).is_none());
    }

    #[test]
    fn test_parse_book_levels_and_snapshot_flag() {
        let element = json!({
            "bids": [["30000.0", "0.5"], ["29999.0", "1.0"]],
            "asks": [["30001.0", "0.2"]],
            "ts": "1700000000000",
            "snapshot": true
        });
        let book = parse_book(&element, "BTCUSDT", Market::Usdtm, false).unwrap();
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 1);
        assert_eq!(book.bids[0].price, 30000.0);
        assert!(book.snapshot);
        assert_eq!(book.ts, 1_700_000_000_000);
    }

    #[test]
    fn test_parse_book_truncates_to_fifty_levels() {
        let levels: Vec<Value> = (0..80)
            .map(|i| json!([format!("{}", 30000 - i), "0.1"]))
            .collect();
        let element = json!({ "bids": levels, "asks": [] });
        let book = parse_book(&element, "BTCUSDT", Market::Usdtm, true).unwrap();
        assert_eq!(book.bids.len(), 50);
        assert!(book.snapshot);
    }

    #[test]
    fn test_parse_book_empty_is_rejected() {
        let element = json!({ "bids": [], "asks": [] });
        assert!(parse_book(&element, "BTCUSDT", Market::Usdtm, false).is_none());
    }

    #[test]
    fn test_subscribe_envelope_shape() {
        let group = SubscriptionGroup {
            id: "usdtm-g0".to_string(),
            market: Market::Usdtm,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        };
        let endpoint = BitgetConfig::endpoint(Market::Usdtm);

        let envelope = build_subscribe_envelope(&group, &endpoint, true);
        assert_eq!(envelope["op"], "subscribe");
        let args = envelope["args"].as_array().unwrap();
        // trade + book channel per symbol
        assert_eq!(args.len(), 4);
        assert_eq!(args[0]["instType"], "UMCBL");
        assert_eq!(args[0]["channel"], "trade");
        assert_eq!(args[0]["instId"], "BTCUSDT_UMCBL");
        assert_eq!(args[1]["channel"], BOOK_CHANNEL);
    }

    #[test]
    fn test_subscribe_envelope_public_tier_has_no_book_channel() {
        let group = SubscriptionGroup {
            id: "spot-g0".to_string(),
            market: Market::Spot,
            symbols: vec!["BTCUSDT".to_string()],
        };
        let endpoint = BitgetConfig::endpoint(Market::Spot);

        let envelope = build_subscribe_envelope(&group, &endpoint, false);
        let args = envelope["args"].as_array().unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["instId"], "BTCUSDT_SPBL");
        assert_eq!(args[0]["instType"], "SP");
    }
}
