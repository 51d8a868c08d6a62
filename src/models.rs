use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Market categories carried by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Market {
    Spot,
    Usdtm,
    Coinm,
    Usdcm,
}

impl Market {
    pub const ALL: [Market; 4] = [Market::Spot, Market::Usdtm, Market::Coinm, Market::Usdcm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Spot => "spot",
            Market::Usdtm => "usdtm",
            Market::Coinm => "coinm",
            Market::Usdcm => "usdcm",
        }
    }

    pub fn parse(s: &str) -> Option<Market> {
        match s.to_ascii_lowercase().as_str() {
            "spot" => Some(Market::Spot),
            "usdtm" => Some(Market::Usdtm),
            "coinm" => Some(Market::Coinm),
            "usdcm" => Some(Market::Usdcm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Venue frames carry the side in mixed case.
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// A single ingested trade. Built once from a parsed upstream frame and
/// passed by value downstream, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub market: Market,
    pub price: f64,
    pub size: f64,
    pub side: Side,
    /// Venue timestamp, milliseconds.
    pub ts: i64,
    /// Wall clock at frame reception.
    pub ingested_at: DateTime<Utc>,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Latest 50-level book for one symbol. Superseded by the next update;
/// only the most recent value is retained in the cache with a short TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub symbol: String,
    pub market: Market,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts: i64,
    pub snapshot: bool,
}

/// Per-symbol metadata from the venue catalog, enriched with the 24h
/// notional used for ranking. Immutable for the current working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub market: Market,
    pub base_coin: String,
    pub quote_coin: String,
    pub status: String,
    pub min_size: f64,
    pub max_size: f64,
    pub size_tick: f64,
    pub price_tick: f64,
    pub volume_24h: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_roundtrip() {
        for m in Market::ALL {
            assert_eq!(Market::parse(m.as_str()), Some(m));
        }
        assert_eq!(Market::parse("SPOT"), Some(Market::Spot));
        assert_eq!(Market::parse("margin"), None);
    }

    #[test]
    fn test_side_parse_case_insensitive() {
        assert_eq!(Side::parse("BUY"), Some(Side::Buy));
        assert_eq!(Side::parse("Sell"), Some(Side::Sell));
        assert_eq!(Side::parse("hold"), None);
    }
}
