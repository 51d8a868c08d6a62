//! Working-set selection and subscription grouping.
//!
//! The per-market symbol lists are published as an immutable snapshot;
//! `reconcile` swaps the snapshot under a single writer lock. Sessions
//! are created per `SubscriptionGroup` by the ingest supervisor.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::models::{Market, SymbolMeta};
use crate::upstream::bitget_rest::{rank_by_volume, CatalogClient};

/// A bounded set of symbols served by one upstream streaming session.
#[derive(Debug, Clone)]
pub struct SubscriptionGroup {
    pub id: String,
    pub market: Market,
    pub symbols: Vec<String>,
}

#[derive(Default)]
struct WorkingSet {
    per_market: BTreeMap<Market, Vec<SymbolMeta>>,
}

pub struct SymbolManager {
    catalog: Arc<CatalogClient>,
    min_volume_24h: f64,
    max_symbols_per_market: usize,
    snapshot: ArcSwap<WorkingSet>,
    writer: tokio::sync::Mutex<()>,
}

impl SymbolManager {
    pub fn new(
        catalog: Arc<CatalogClient>,
        min_volume_24h: f64,
        max_symbols_per_market: usize,
    ) -> Self {
        Self {
            catalog,
            min_volume_24h,
            max_symbols_per_market,
            snapshot: ArcSwap::from_pointee(WorkingSet::default()),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// Selects the working set for the given markets and swaps it in.
    /// Called once at startup and again on every capability change.
    pub async fn reconcile(&self, markets: &[Market]) -> Result<usize> {
        let _guard = self.writer.lock().await;

        let mut per_market = BTreeMap::new();
        let mut total = 0usize;
        for &market in markets {
            let mut metas = self
                .catalog
                .top_by_volume(market, self.max_symbols_per_market)
                .await?;
            metas.retain(|m| m.volume_24h >= self.min_volume_24h);
            rank_by_volume(&mut metas);

            for m in &metas {
                debug!("activated {} ({})", m.symbol, market);
            }
            info!("✅ Market {}: {} symbols selected", market, metas.len());
            total += metas.len();
            per_market.insert(market, metas);
        }

        self.snapshot.store(Arc::new(WorkingSet { per_market }));
        info!("📊 Working set updated: {} symbols total", total);
        Ok(total)
    }

    /// The ordered working set for one market.
    pub fn symbols_for(&self, market: Market) -> Vec<SymbolMeta> {
        self.snapshot
            .load()
            .per_market
            .get(&market)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all_symbols(&self) -> Vec<SymbolMeta> {
        self.snapshot
            .load()
            .per_market
            .values()
            .flatten()
            .cloned()
            .collect()
    }

    pub fn total_symbols(&self) -> usize {
        self.snapshot.load().per_market.values().map(Vec::len).sum()
    }

    pub fn symbol_info(&self, symbol: &str, market: Market) -> Option<SymbolMeta> {
        self.snapshot
            .load()
            .per_market
            .get(&market)?
            .iter()
            .find(|m| m.symbol == symbol)
            .cloned()
    }

    /// First market whose working set carries the symbol.
    pub fn market_of(&self, symbol: &str) -> Option<Market> {
        let snapshot = self.snapshot.load();
        snapshot
            .per_market
            .iter()
            .find(|(_, metas)| metas.iter().any(|m| m.symbol == symbol))
            .map(|(market, _)| *market)
    }

    /// Top symbols across one market or all of them.
    pub fn top(&self, market: Option<Market>, limit: usize) -> Vec<SymbolMeta> {
        let mut metas = match market {
            Some(m) => self.symbols_for(m),
            None => self.all_symbols(),
        };
        rank_by_volume(&mut metas);
        metas.truncate(limit);
        metas
    }

    /// Partitions the working set into subscription groups sized by the
    /// active capability profile.
    pub fn groups(&self, max_per_group: usize) -> Vec<SubscriptionGroup> {
        let snapshot = self.snapshot.load();
        let mut groups = Vec::new();
        for (&market, metas) in &snapshot.per_market {
            let symbols: Vec<String> = metas.iter().map(|m| m.symbol.clone()).collect();
            groups.extend(partition_groups(market, &symbols, max_per_group));
        }
        groups
    }
}

/// Splits one market's ordered symbol list into stable-id groups.
fn partition_groups(
    market: Market,
    symbols: &[String],
    max_per_group: usize,
) -> Vec<SubscriptionGroup> {
    let size = max_per_group.max(1);
    symbols
        .chunks(size)
        .enumerate()
        .map(|(idx, chunk)| SubscriptionGroup {
            id: format!("{market}-g{idx}"),
            market,
            symbols: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partition_respects_group_size() {
        let symbols = syms(&["A", "B", "C", "D", "E"]);
        let groups = partition_groups(Market::Spot, &symbols, 2);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].id, "spot-g0");
        assert_eq!(groups[0].symbols, syms(&["A", "B"]));
        assert_eq!(groups[2].symbols, syms(&["E"]));
        assert!(groups.iter().all(|g| g.symbols.len() <= 2));
    }

    #[test]
    fn test_partition_empty_working_set_yields_no_groups() {
        let groups = partition_groups(Market::Usdtm, &[], 10);
        assert!(groups.is_empty());
    }

    #[test]
    fn test_partition_preserves_order() {
        let symbols = syms(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        let groups = partition_groups(Market::Usdtm, &symbols, 10);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].symbols, symbols);
        assert_eq!(groups[0].market, Market::Usdtm);
    }
}
