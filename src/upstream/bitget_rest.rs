//! Venue REST catalog client (read-only).
//!
//! Symbol discovery plus the 24h ticker notional used for ranking.
//! Every call passes through the shared rate limiter and a circuit
//! breaker; requests are signed when privileged credentials are present.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde_json::Value;
use sha2::Sha256;

use crate::limits::{AdaptiveRateLimiter, CircuitBreaker};
use crate::models::{Market, SymbolMeta};
use crate::policy::Credentials;

type HmacSha256 = Hmac<Sha256>;

const SPOT_SYMBOLS: &str = "/api/v2/spot/public/symbols";
const SPOT_TICKERS: &str = "/api/v2/spot/market/tickers";
const FUTURES_SYMBOLS: &str = "/api/v2/mix/market/contracts";
const FUTURES_TICKERS: &str = "/api/v2/mix/market/tickers";

const VENUE_OK: &str = "00000";

/// The catalog answered with a non-success venue code.
#[derive(Debug)]
pub struct CatalogError {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "catalog error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for CatalogError {}

pub struct CatalogClient {
    public_http: reqwest::Client,
    signed_http: reqwest::Client,
    base_url: String,
    credentials: ArcSwap<Credentials>,
    limiter: Arc<AdaptiveRateLimiter>,
    breaker: CircuitBreaker,
}

impl CatalogClient {
    pub fn new(
        base_url: String,
        credentials: Credentials,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Result<Self> {
        let public_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .context("build public catalog client")?;
        let signed_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .context("build signed catalog client")?;

        Ok(Self {
            public_http,
            signed_http,
            base_url,
            credentials: ArcSwap::from_pointee(credentials),
            limiter,
            breaker: CircuitBreaker::default(),
        })
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        self.credentials.store(Arc::new(credentials));
    }

    pub fn credentials(&self) -> Arc<Credentials> {
        self.credentials.load_full()
    }

    fn sign_headers(&self, creds: &Credentials, endpoint: &str) -> Result<HeaderMap> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let message = format!("{timestamp}GET{endpoint}");

        let mut mac = HmacSha256::new_from_slice(creds.secret_key.as_bytes())
            .context("invalid secret key")?;
        mac.update(message.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("ACCESS-KEY", creds.api_key.parse().context("api key header")?);
        headers.insert("ACCESS-SIGN", signature.parse().context("signature header")?);
        headers.insert(
            "ACCESS-TIMESTAMP",
            timestamp.parse().context("timestamp header")?,
        );
        headers.insert(
            "ACCESS-PASSPHRASE",
            creds.passphrase.parse().context("passphrase header")?,
        );
        Ok(headers)
    }

    /// GET a venue endpoint, returning the `data` payload once the venue
    /// success code has been checked.
    async fn get_data(&self, endpoint: &str, query: &[(&str, String)]) -> Result<Value> {
        self.limiter.acquire().await;

        let result = self
            .breaker
            .execute(async {
                let creds = self.credentials.load_full();
                let (client, headers) = if creds.is_privileged() {
                    (&self.signed_http, Some(self.sign_headers(&creds, endpoint)?))
                } else {
                    (&self.public_http, None)
                };

                let mut req = client.get(format!("{}{}", self.base_url, endpoint));
                if !query.is_empty() {
                    req = req.query(query);
                }
                if let Some(h) = headers {
                    req = req.headers(h);
                }

                let resp = req.send().await.with_context(|| format!("GET {endpoint}"))?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    anyhow::bail!("GET {endpoint} {status}: {text}");
                }

                let body: Value = resp
                    .json()
                    .await
                    .with_context(|| format!("parse {endpoint} body"))?;

                let code = body.get("code").and_then(Value::as_str).unwrap_or("");
                if code != VENUE_OK {
                    let message = body
                        .get("msg")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    return Err(CatalogError {
                        code: code.to_string(),
                        message,
                    }
                    .into());
                }
                Ok(body.get("data").cloned().unwrap_or(Value::Null))
            })
            .await;

        match &result {
            Ok(_) => self.limiter.report_success(),
            Err(e) => self.limiter.report_error(&e.to_string()),
        }
        result
    }

    /// Cheap liveness/validation call: the public spot symbol list. Also
    /// exercises the signature path when privileged credentials are set.
    pub async fn probe(&self) -> Result<usize> {
        let data = self.get_data(SPOT_SYMBOLS, &[]).await?;
        Ok(data.as_array().map(Vec::len).unwrap_or(0))
    }

    pub async fn tickers_probe(&self) -> Result<usize> {
        let data = self.get_data(SPOT_TICKERS, &[]).await?;
        Ok(data.as_array().map(Vec::len).unwrap_or(0))
    }

    /// Online spot symbols with 24h notional joined from the tickers.
    pub async fn list_spot_symbols(&self) -> Result<Vec<SymbolMeta>> {
        let symbols = self.get_data(SPOT_SYMBOLS, &[]).await?;
        let tickers = self.get_data(SPOT_TICKERS, &[]).await?;
        let volumes = volume_index(&tickers);

        let mut metas = Vec::new();
        for item in symbols.as_array().into_iter().flatten() {
            if item.get("status").and_then(Value::as_str) != Some("online") {
                continue;
            }
            metas.push(parse_spot_symbol(item, &volumes));
        }
        Ok(metas)
    }

    /// Normal-status futures symbols for one margined market.
    pub async fn list_futures_symbols(&self, market: Market) -> Result<Vec<SymbolMeta>> {
        let product = product_type(market)
            .ok_or_else(|| anyhow::anyhow!("{market} is not a futures market"))?;
        let query = [("productType", product.to_string())];
        let symbols = self.get_data(FUTURES_SYMBOLS, &query).await?;
        let tickers = self.get_data(FUTURES_TICKERS, &query).await?;
        let volumes = volume_index(&tickers);

        let mut metas = Vec::new();
        for item in symbols.as_array().into_iter().flatten() {
            if item.get("status").and_then(Value::as_str) != Some("normal") {
                continue;
            }
            metas.push(parse_futures_symbol(item, market, &volumes));
        }
        Ok(metas)
    }

    /// The `limit` highest-notional symbols of a market, ordered by
    /// descending 24h notional then symbol id.
    pub async fn top_by_volume(&self, market: Market, limit: usize) -> Result<Vec<SymbolMeta>> {
        let mut metas = match market {
            Market::Spot => self.list_spot_symbols().await?,
            _ => self.list_futures_symbols(market).await?,
        };
        rank_by_volume(&mut metas);
        metas.truncate(limit);
        Ok(metas)
    }
}

fn product_type(market: Market) -> Option<&'static str> {
    match market {
        Market::Spot => None,
        Market::Usdtm => Some("USDT-FUTURES"),
        Market::Coinm => Some("COIN-FUTURES"),
        Market::Usdcm => Some("USDC-FUTURES"),
    }
}

/// symbol -> 24h quote notional, from a ticker array.
fn volume_index(tickers: &Value) -> std::collections::HashMap<String, f64> {
    let mut index = std::collections::HashMap::new();
    for t in tickers.as_array().into_iter().flatten() {
        let Some(symbol) = t.get("symbol").and_then(Value::as_str) else {
            continue;
        };
        let volume = ["usdtVolume", "quoteVolume", "quoteVol"]
            .iter()
            .find_map(|k| t.get(*k).map(f64_value))
            .unwrap_or(0.0);
        index.insert(symbol.to_string(), volume);
    }
    index
}

fn f64_value(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn f64_field(item: &Value, key: &str) -> f64 {
    item.get(key).map(f64_value).unwrap_or(0.0)
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_spot_symbol(
    item: &Value,
    volumes: &std::collections::HashMap<String, f64>,
) -> SymbolMeta {
    let symbol = str_field(item, "symbol");
    SymbolMeta {
        volume_24h: volumes.get(&symbol).copied().unwrap_or(0.0),
        market: Market::Spot,
        base_coin: str_field(item, "baseCoin"),
        quote_coin: str_field(item, "quoteCoin"),
        status: str_field(item, "status"),
        min_size: f64_field(item, "minTradeAmount"),
        max_size: f64_field(item, "maxTradeAmount"),
        size_tick: f64_field(item, "quantityScale"),
        price_tick: f64_field(item, "priceScale"),
        symbol,
    }
}

fn parse_futures_symbol(
    item: &Value,
    market: Market,
    volumes: &std::collections::HashMap<String, f64>,
) -> SymbolMeta {
    let symbol = str_field(item, "symbol");
    SymbolMeta {
        volume_24h: volumes.get(&symbol).copied().unwrap_or(0.0),
        market,
        base_coin: str_field(item, "baseCoin"),
        quote_coin: {
            let q = str_field(item, "quoteCoin");
            if q.is_empty() {
                "USDT".to_string()
            } else {
                q
            }
        },
        status: str_field(item, "status"),
        min_size: f64_field(item, "minTradeNum"),
        max_size: f64_field(item, "maxTradeNum"),
        size_tick: f64_field(item, "sizeMultiplier"),
        price_tick: f64_field(item, "pricePlace"),
        symbol,
    }
}

/// Descending 24h notional, symbol id as the tie-break.
pub fn rank_by_volume(metas: &mut [SymbolMeta]) {
    metas.sort_by(|a, b| {
        b.volume_24h
            .partial_cmp(&a.volume_24h)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_spot_symbol() {
        let item = json!({
            "symbol": "BTCUSDT",
            "baseCoin": "BTC",
            "quoteCoin": "USDT",
            "status": "online",
            "minTradeAmount": "0.0001",
            "maxTradeAmount": "10000",
            "quantityScale": "4",
            "priceScale": "2"
        });
        let mut volumes = std::collections::HashMap::new();
        volumes.insert("BTCUSDT".to_string(), 5_000_000.0);

        let meta = parse_spot_symbol(&item, &volumes);
        assert_eq!(meta.symbol, "BTCUSDT");
        assert_eq!(meta.market, Market::Spot);
        assert_eq!(meta.min_size, 0.0001);
        assert_eq!(meta.volume_24h, 5_000_000.0);
    }

    #[test]
    fn test_parse_futures_symbol_defaults_quote() {
        let item = json!({
            "symbol": "ETHUSDT",
            "baseCoin": "ETH",
            "status": "normal",
            "minTradeNum": "0.01",
            "maxTradeNum": "5000",
            "sizeMultiplier": "0.01",
            "pricePlace": "2"
        });
        let meta = parse_futures_symbol(&item, Market::Usdtm, &Default::default());
        assert_eq!(meta.quote_coin, "USDT");
        assert_eq!(meta.market, Market::Usdtm);
        assert_eq!(meta.volume_24h, 0.0);
    }

    #[test]
    fn test_volume_index_accepts_string_and_number() {
        let tickers = json!([
            {"symbol": "BTCUSDT", "usdtVolume": "123.5"},
            {"symbol": "ETHUSDT", "quoteVolume": 99.0}
        ]);
        let index = volume_index(&tickers);
        assert_eq!(index["BTCUSDT"], 123.5);
        assert_eq!(index["ETHUSDT"], 99.0);
    }

    #[test]
    fn test_rank_by_volume_tie_break() {
        let mut metas = vec![
            parse_spot_symbol(&json!({"symbol": "BBB", "status": "online"}), &{
                let mut v = std::collections::HashMap::new();
                v.insert("BBB".to_string(), 100.0);
                v
            }),
            parse_spot_symbol(&json!({"symbol": "AAA", "status": "online"}), &{
                let mut v = std::collections::HashMap::new();
                v.insert("AAA".to_string(), 100.0);
                v
            }),
            parse_spot_symbol(&json!({"symbol": "CCC", "status": "online"}), &{
                let mut v = std::collections::HashMap::new();
                v.insert("CCC".to_string(), 200.0);
                v
            }),
        ];
        rank_by_volume(&mut metas);
        let order: Vec<&str> = metas.iter().map(|m| m.symbol.as_str()).collect();
        assert_eq!(order, vec!["CCC", "AAA", "BBB"]);
    }

    #[test]
    fn test_product_type_mapping() {
        assert_eq!(product_type(Market::Usdtm), Some("USDT-FUTURES"));
        assert_eq!(product_type(Market::Coinm), Some("COIN-FUTURES"));
        assert_eq!(product_type(Market::Usdcm), Some("USDC-FUTURES"));
        assert_eq!(product_type(Market::Spot), None);
    }
}
