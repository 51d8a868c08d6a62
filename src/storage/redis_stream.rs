//! Cache/stream sink.
//!
//! Trades land in capped per-symbol streams (`trades:{symbol}:{market}`),
//! books in short-TTL value keys (`orderbook:{symbol}:{market}`), both as
//! gzip-compressed canonical JSON. Duplicate trades inside the dedup
//! window are suppressed by a SHA-256 guard kept both in-process and in
//! the store (`trade_dedup:{hash}`).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::models::{BookUpdate, Market, Trade};

pub struct StreamSink {
    pool: Vec<MultiplexedConnection>,
    next: AtomicUsize,
    stream_maxlen: usize,
    orderbook_ttl_secs: u64,
    dedup_window: Duration,
    dedup_local: Mutex<HashMap<String, Instant>>,
}

impl StreamSink {
    pub async fn connect(
        cfg: &RedisConfig,
        verify_tls: bool,
        dedup_window_secs: u64,
    ) -> Result<Self> {
        let url = cfg.url(verify_tls);
        let client = redis::Client::open(url.as_str()).context("invalid redis url")?;

        let mut pool = Vec::with_capacity(cfg.pool_size);
        for _ in 0..cfg.pool_size {
            pool.push(
                client
                    .get_multiplexed_tokio_connection()
                    .await
                    .context("redis connect")?,
            );
        }
        info!(
            "✅ Cache sink connected ({}:{}, pool={})",
            cfg.host, cfg.port, cfg.pool_size
        );

        Ok(Self {
            pool,
            next: AtomicUsize::new(0),
            stream_maxlen: cfg.stream_maxlen,
            orderbook_ttl_secs: cfg.orderbook_ttl_secs,
            dedup_window: Duration::from_secs(dedup_window_secs),
            dedup_local: Mutex::new(HashMap::with_capacity(1024)),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }

    /// Publishes a trade unless its dedup key was already seen inside the
    /// window. Returns true on first publication. Idempotent under retries.
    pub async fn publish_trade(&self, trade: &Trade) -> Result<bool> {
        let hash = trade_hash(trade);

        {
            let mut local = self.dedup_local.lock();
            let now = Instant::now();
            local.retain(|_, stamp| now.duration_since(*stamp) < self.dedup_window);
            if local.contains_key(&hash) {
                return Ok(false);
            }
        }

        let mut conn = self.conn();

        // First-writer-wins: a nil reply means the guard already existed.
        let guard_key = format!("trade_dedup:{hash}");
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&guard_key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.dedup_window.as_secs())
            .query_async(&mut conn)
            .await
            .context("dedup guard SET")?;

        if claimed.is_none() {
            self.dedup_local.lock().insert(hash, Instant::now());
            return Ok(false);
        }

        let payload = compress(&serde_json::to_vec(trade)?)?;
        let stream_key = format!("trades:{}:{}", trade.symbol, trade.market);
        let entry_id = format!("{}-0", trade.ts);

        let added: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.stream_maxlen)
            .arg(&entry_id)
            .arg("data")
            .arg(payload.as_slice())
            .query_async(&mut conn)
            .await;

        match added {
            Ok(_) => {}
            // A distinct trade colliding on the millisecond id: let the
            // server pick the sequence instead of losing the entry.
            Err(e) if e.to_string().contains("equal or smaller") => {
                debug!(stream = %stream_key, id = %entry_id, "entry id collision, using auto id");
                let _: String = redis::cmd("XADD")
                    .arg(&stream_key)
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(self.stream_maxlen)
                    .arg("*")
                    .arg("data")
                    .arg(payload.as_slice())
                    .query_async(&mut conn)
                    .await
                    .context("XADD trade (auto id)")?;
            }
            Err(e) => return Err(anyhow::Error::new(e).context("XADD trade")),
        }

        self.dedup_local.lock().insert(hash, Instant::now());
        Ok(true)
    }

    /// Latest-wins book write with a short TTL.
    pub async fn put_book(&self, book: &BookUpdate) -> Result<()> {
        let payload = compress(&serde_json::to_vec(book)?)?;
        let key = format!("orderbook:{}:{}", book.symbol, book.market);
        let mut conn = self.conn();
        let _: String = redis::cmd("SETEX")
            .arg(&key)
            .arg(self.orderbook_ttl_secs)
            .arg(payload.as_slice())
            .query_async(&mut conn)
            .await
            .context("SETEX orderbook")?;
        Ok(())
    }

    /// Most recent trades for one stream, oldest first.
    pub async fn recent_trades(
        &self,
        symbol: &str,
        market: Market,
        count: usize,
    ) -> Result<Vec<Trade>> {
        let stream_key = format!("trades:{symbol}:{market}");
        let mut conn = self.conn();
        let entries: Vec<(String, Vec<(String, Vec<u8>)>)> = redis::cmd("XREVRANGE")
            .arg(&stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .context("XREVRANGE trades")?;

        let mut trades = Vec::with_capacity(entries.len());
        for (_id, fields) in entries.into_iter().rev() {
            let Some((_, raw)) = fields.into_iter().find(|(k, _)| k == "data") else {
                continue;
            };
            match decompress(&raw).and_then(|b| Ok(serde_json::from_slice::<Trade>(&b)?)) {
                Ok(trade) => trades.push(trade),
                Err(e) => debug!(stream = %stream_key, error = %e, "skipping undecodable entry"),
            }
        }
        Ok(trades)
    }

    /// Liveness probe.
    pub async fn ping(&self) -> bool {
        let mut conn = self.conn();
        matches!(
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await,
            Ok(ref pong) if pong == "PONG"
        )
    }
}

/// Dedup key over the trade identity; the side is deliberately excluded so
/// a venue replay with a flipped-case side still dedupes.
pub fn trade_hash(trade: &Trade) -> String {
    let data = format!(
        "{}:{}:{}:{}:{}",
        trade.symbol, trade.market, trade.ts, trade.price, trade.size
    );
    let digest = Sha256::digest(data.as_bytes());
    format!("{digest:x}")
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    fn trade(ts: i64, price: f64, size: f64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            market: Market::Spot,
            price,
            size,
            side: Side::Buy,
            ts,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn test_trade_hash_is_stable_and_discriminating() {
        let a = trade(1_700_000_000_000, 30_000.0, 0.1);
        let b = trade(1_700_000_000_000, 30_000.0, 0.1);
        assert_eq!(trade_hash(&a), trade_hash(&b));

        let c = trade(1_700_000_000_000, 30_000.0, 0.2);
        assert_ne!(trade_hash(&a), trade_hash(&c));

        let d = trade(1_700_000_000_001, 30_000.0, 0.1);
        assert_ne!(trade_hash(&a), trade_hash(&d));
    }

    #[test]
    fn test_hash_ignores_side() {
        let buy = trade(1_700_000_000_000, 30_000.0, 0.1);
        let mut sell = buy.clone();
        sell.side = Side::Sell;
        assert_eq!(trade_hash(&buy), trade_hash(&sell));
    }

    #[test]
    fn test_payload_roundtrip() {
        let t = trade(1_700_000_000_000, 30_000.0, 0.1);
        let packed = compress(&serde_json::to_vec(&t).unwrap()).unwrap();
        assert!(packed.len() > 0);

        let unpacked: Trade =
            serde_json::from_slice(&decompress(&packed).unwrap()).unwrap();
        assert_eq!(unpacked.symbol, t.symbol);
        assert_eq!(unpacked.ts, t.ts);
        assert_eq!(unpacked.price, t.price);
    }
}
