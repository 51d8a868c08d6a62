//! Dashboard fan-out broker.
//!
//! Multiplexes ingested messages to every client session subscribed to a
//! symbol. Broadcasts are debounced per symbol (latest wins inside the
//! window) and delivered by a periodic batch flusher, so at most one value
//! per symbol is in flight per tick. Send failures reap the session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Trade;

const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Handle returned to the socket task for one dashboard client.
pub struct ClientHandle {
    pub id: Uuid,
    pub rx: mpsc::Receiver<String>,
}

struct SymbolChannel {
    clients: HashMap<Uuid, mpsc::Sender<String>>,
    pending: VecDeque<Value>,
    last_accept: Option<Instant>,
}

#[derive(Default)]
struct BrokerCounters {
    messages_sent: AtomicU64,
    messages_queued: AtomicU64,
    connections_total: AtomicU64,
    errors_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerMetrics {
    pub messages_sent: u64,
    pub messages_queued: u64,
    pub connections_total: u64,
    pub errors_count: u64,
    pub active_symbols: usize,
    pub total_connections: usize,
    pub batch_interval_ms: u64,
    pub debounce_ms: u64,
}

pub struct FanOutBroker {
    channels: Mutex<HashMap<String, SymbolChannel>>,
    counters: BrokerCounters,
    batch_interval: Duration,
    debounce_ms: u64,
}

impl FanOutBroker {
    pub fn new(batch_interval_ms: u64, debounce_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            counters: BrokerCounters::default(),
            batch_interval: Duration::from_millis(batch_interval_ms.max(1)),
            debounce_ms,
        })
    }

    pub fn default_debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    /// Attaches a client session to a symbol and queues the hello frame.
    pub fn connect(&self, symbol: &str) -> ClientHandle {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        let hello = json!({
            "type": "connection",
            "status": "connected",
            "symbol": symbol,
            "server_time_ms": Utc::now().timestamp_millis(),
        });
        let _ = tx.try_send(hello.to_string());

        let mut channels = self.channels.lock();
        let channel = channels
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolChannel {
                clients: HashMap::new(),
                pending: VecDeque::new(),
                last_accept: None,
            });
        channel.clients.insert(id, tx);
        self.counters.connections_total.fetch_add(1, Ordering::Relaxed);

        info!("Client {} connected to {}", id, symbol);
        ClientHandle { id, rx }
    }

    /// Removes a client; the symbol entry disappears with its last client.
    pub fn disconnect(&self, symbol: &str, id: Uuid) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(symbol) {
            channel.clients.remove(&id);
            if channel.clients.is_empty() {
                channels.remove(symbol);
            }
        }
        info!("Client {} disconnected from {}", id, symbol);
    }

    /// Enqueues a message for a symbol. With a non-zero debounce the
    /// pending slot is overwritten (latest wins) and the accept timestamp
    /// only advances outside the window; with zero debounce messages queue
    /// up and are all delivered at the next flush.
    pub fn broadcast(&self, symbol: &str, message: Value, debounce_ms: u64) {
        let mut channels = self.channels.lock();
        // a symbol entry exists iff its client set is non-empty
        let Some(channel) = channels.get_mut(symbol) else {
            return;
        };

        if debounce_ms == 0 {
            channel.pending.push_back(message);
        } else {
            let now = Instant::now();
            let within_window = channel
                .last_accept
                .map(|t| now.duration_since(t) < Duration::from_millis(debounce_ms))
                .unwrap_or(false);
            channel.pending.clear();
            channel.pending.push_back(message);
            if !within_window {
                channel.last_accept = Some(now);
            }
        }
        self.counters.messages_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// One flusher pass: deliver pending content and reap dead sessions.
    pub fn flush_once(&self) -> Result<()> {
        let mut channels = self.channels.lock();
        let mut dead: Vec<(String, Uuid)> = Vec::new();

        for (symbol, channel) in channels.iter_mut() {
            if channel.pending.is_empty() {
                continue;
            }
            for message in channel.pending.drain(..) {
                let text = message.to_string();
                for (id, tx) in &channel.clients {
                    if tx.try_send(text.clone()).is_ok() {
                        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.counters.errors_count.fetch_add(1, Ordering::Relaxed);
                        dead.push((symbol.clone(), *id));
                    }
                }
            }
        }

        for (symbol, id) in dead {
            debug!("Reaping dead client {} on {}", id, symbol);
            if let Some(channel) = channels.get_mut(&symbol) {
                channel.clients.remove(&id);
                if channel.clients.is_empty() {
                    channels.remove(&symbol);
                }
            }
        }
        Ok(())
    }

    /// Background flusher. Internal errors are counted and the loop backs
    /// off briefly instead of aborting.
    pub async fn run_flusher(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        info!(
            "WebSocket broker flusher started (batch {}ms, debounce {}ms)",
            self.batch_interval.as_millis(),
            self.debounce_ms
        );
        let mut ticker = tokio::time::interval(self.batch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        info!("WebSocket broker flusher stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_once() {
                        self.counters.errors_count.fetch_add(1, Ordering::Relaxed);
                        warn!("Broker flush error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    pub fn connection_count(&self, symbol: Option<&str>) -> usize {
        let channels = self.channels.lock();
        match symbol {
            Some(s) => channels.get(s).map(|c| c.clients.len()).unwrap_or(0),
            None => channels.values().map(|c| c.clients.len()).sum(),
        }
    }

    pub fn metrics(&self) -> BrokerMetrics {
        let channels = self.channels.lock();
        BrokerMetrics {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_queued: self.counters.messages_queued.load(Ordering::Relaxed),
            connections_total: self.counters.connections_total.load(Ordering::Relaxed),
            errors_count: self.counters.errors_count.load(Ordering::Relaxed),
            active_symbols: channels.len(),
            total_connections: channels.values().map(|c| c.clients.len()).sum(),
            batch_interval_ms: self.batch_interval.as_millis() as u64,
            debounce_ms: self.debounce_ms,
        }
    }
}

/// Client-facing trade frame.
pub fn trade_frame(trade: &Trade) -> Value {
    json!({
        "type": "trade",
        "symbol": trade.symbol,
        "market": trade.market,
        "price": trade.price,
        "size": trade.size,
        "side": trade.side,
        "ts": trade.ts,
        "server_time_ms": Utc::now().timestamp_millis(),
    })
}
