//! Environment-driven configuration.
//!
//! Every component gets its config from here; nothing reads `std::env`
//! past startup. Missing or invalid values fall back to defaults.

use std::env;

use crate::models::Market;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Cache/stream store connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub pool_size: usize,
    pub stream_maxlen: usize,
    pub orderbook_ttl_secs: u64,
}

impl RedisConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6380),
            password: env_string("REDIS_PASSWORD", ""),
            pool_size: 20,
            stream_maxlen: 50_000,
            orderbook_ttl_secs: 30,
        }
    }

    /// TLS is enabled automatically for non-loopback peers.
    pub fn url(&self, verify_tls: bool) -> String {
        let loopback = matches!(self.host.as_str(), "localhost" | "127.0.0.1" | "::1");
        let scheme = if loopback { "redis" } else { "rediss" };
        let auth = if self.password.is_empty() {
            String::new()
        } else {
            format!(":{}@", self.password)
        };
        let insecure = if scheme == "rediss" && !verify_tls {
            "#insecure"
        } else {
            ""
        };
        format!("{scheme}://{auth}{}:{}/{insecure}", self.host, self.port)
    }
}

/// Analytical store boundary (liveness probe + bulk insert only).
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub batch_size: usize,
}

impl ClickHouseConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_string("CLICKHOUSE_HOST", "localhost"),
            port: env_parse("CLICKHOUSE_PORT", 8123),
            database: "trading".to_string(),
            username: env_string("CLICKHOUSE_USER", "default"),
            password: env_string("CLICKHOUSE_PASSWORD", ""),
            batch_size: 1000,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Per-market streaming endpoint mapping. Fixed, venue-specific.
#[derive(Debug, Clone)]
pub struct MarketEndpoint {
    pub ws_url: &'static str,
    pub inst_type: &'static str,
    pub suffix: &'static str,
}

const WS_URL_SPOT: &str = "wss://ws.bitget.com/spot/v1/stream";
const WS_URL_MIX: &str = "wss://ws.bitget.com/mix/v1/stream";

/// Venue connectivity settings.
#[derive(Debug, Clone)]
pub struct BitgetConfig {
    pub rest_base_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    pub max_rps: f64,
}

impl BitgetConfig {
    pub fn from_env() -> Self {
        Self {
            rest_base_url: "https://api.bitget.com".to_string(),
            api_key: env_string("BITGET_API_KEY", ""),
            secret_key: env_string("BITGET_SECRET_KEY", ""),
            passphrase: env_string("BITGET_PASSPHRASE", ""),
            max_rps: 8.0,
        }
    }

    pub fn endpoint(market: Market) -> MarketEndpoint {
        match market {
            Market::Spot => MarketEndpoint {
                ws_url: WS_URL_SPOT,
                inst_type: "SP",
                suffix: "_SPBL",
            },
            Market::Usdtm => MarketEndpoint {
                ws_url: WS_URL_MIX,
                inst_type: "UMCBL",
                suffix: "_UMCBL",
            },
            Market::Coinm => MarketEndpoint {
                ws_url: WS_URL_MIX,
                inst_type: "DMCBL",
                suffix: "_DMCBL",
            },
            Market::Usdcm => MarketEndpoint {
                ws_url: WS_URL_MIX,
                inst_type: "CMCBL",
                suffix: "_CMCBL",
            },
        }
    }
}

/// Outbound TLS material for the cache store.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_certs: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub verify: bool,
}

impl TlsConfig {
    pub fn from_env() -> Self {
        Self {
            ca_certs: env::var("SSL_CA_CERTS").ok(),
            cert_file: env::var("SSL_CERT_FILE").ok(),
            key_file: env::var("SSL_KEY_FILE").ok(),
            verify: env_string("SSL_VERIFY", "true") == "true",
        }
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub min_volume_24h: f64,
    pub max_symbols_per_market: usize,
    pub dedup_window_secs: u64,
    pub health_interval_secs: u64,
    pub broker_batch_interval_ms: u64,
    pub broker_debounce_ms: u64,
}

impl SystemConfig {
    pub fn from_env() -> Self {
        Self {
            min_volume_24h: env_parse("MIN_VOLUME_24H", 1_000_000.0),
            max_symbols_per_market: env_parse("MAX_SYMBOLS_PER_MARKET", 30),
            dedup_window_secs: 3600,
            health_interval_secs: 30,
            broker_batch_interval_ms: 50,
            broker_debounce_ms: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub clickhouse: ClickHouseConfig,
    pub bitget: BitgetConfig,
    pub tls: TlsConfig,
    pub system: SystemConfig,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            redis: RedisConfig::from_env(),
            clickhouse: ClickHouseConfig::from_env(),
            bitget: BitgetConfig::from_env(),
            tls: TlsConfig::from_env(),
            system: SystemConfig::from_env(),
            port: env_parse("PORT", 8000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_loopback_plaintext() {
        let cfg = RedisConfig {
            host: "localhost".to_string(),
            port: 6380,
            password: String::new(),
            pool_size: 20,
            stream_maxlen: 50_000,
            orderbook_ttl_secs: 30,
        };
        assert_eq!(cfg.url(true), "redis://localhost:6380/");
    }

    #[test]
    fn test_redis_url_remote_tls_with_auth() {
        let cfg = RedisConfig {
            host: "cache.internal".to_string(),
            port: 6379,
            password: "s3cret".to_string(),
            pool_size: 20,
            stream_maxlen: 50_000,
            orderbook_ttl_secs: 30,
        };
        assert_eq!(cfg.url(true), "rediss://:s3cret@cache.internal:6379/");
        assert_eq!(
            cfg.url(false),
            "rediss://:s3cret@cache.internal:6379/#insecure"
        );
    }

    #[test]
    fn test_market_endpoint_mapping() {
        assert_eq!(BitgetConfig::endpoint(Market::Spot).suffix, "_SPBL");
        assert_eq!(BitgetConfig::endpoint(Market::Usdtm).inst_type, "UMCBL");
        assert_eq!(BitgetConfig::endpoint(Market::Coinm).ws_url, WS_URL_MIX);
        assert_eq!(BitgetConfig::endpoint(Market::Usdcm).suffix, "_CMCBL");
    }
}
