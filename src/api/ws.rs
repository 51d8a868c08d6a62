//! Dashboard WebSocket endpoint.
//!
//! Upgrades the connection, replays a short trade snapshot from the
//! stream sink, then hands the session to the fan-out broker. Clients
//! are expected to show activity every 30 s; after an unanswered ping
//! the session is closed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    response::Response,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::broker::trade_frame;
use crate::context::AppContext;

const CLIENT_IDLE: Duration = Duration::from_secs(30);
const SNAPSHOT_TRADES: usize = 30;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    State(ctx): State<Arc<AppContext>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, symbol))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppContext>, symbol: String) {
    let mut handle = ctx.broker.connect(&symbol);

    // Replay recent history so the dashboard isn't empty before the first
    // live tick arrives.
    if let Some(market) = ctx.symbols.market_of(&symbol) {
        match ctx.sink.recent_trades(&symbol, market, SNAPSHOT_TRADES).await {
            Ok(trades) => {
                for trade in trades {
                    let text = trade_frame(&trade).to_string();
                    if socket.send(Message::Text(text)).await.is_err() {
                        ctx.broker.disconnect(&symbol, handle.id);
                        return;
                    }
                }
            }
            Err(e) => debug!(symbol = %symbol, error = %e, "trade snapshot replay failed"),
        }
    }

    let mut last_activity = Instant::now();
    let mut ping_outstanding = false;
    let mut idle_check = tokio::time::interval(Duration::from_secs(5));
    idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            // fan-out traffic from the broker
            queued = handle.rx.recv() => {
                let Some(text) = queued else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }

            // client traffic: answer pings, track liveness
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        ping_outstanding = false;
                        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                            if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
                                let pong = json!({
                                    "type": "pong",
                                    "server_time_ms": Utc::now().timestamp_millis(),
                                });
                                let _ = socket.send(Message::Text(pong.to_string())).await;
                            }
                        } else if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                        ping_outstanding = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }

            // idle supervision: one ping, then close on continued silence
            _ = idle_check.tick() => {
                if last_activity.elapsed() < CLIENT_IDLE {
                    continue;
                }
                if ping_outstanding {
                    info!(symbol = %symbol, "closing idle client session");
                    break;
                }
                let ping = json!({
                    "type": "ping",
                    "server_time_ms": Utc::now().timestamp_millis(),
                });
                if socket.send(Message::Text(ping.to_string())).await.is_err() {
                    break;
                }
                ping_outstanding = true;
                last_activity = Instant::now();
            }
        }
    }

    ctx.broker.disconnect(&symbol, handle.id);
}
