//! Per-exchange price store
//!
//! Each exchange owns one `ExchangeMarketPrices`, written only by that
//! exchange's encoder and read by the updater.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::median::{median, within_window};
use crate::types::{ExchangeId, MarketId, MarketParam, MarketPriceTimestamp};

/// Latest price per market for a single exchange
#[derive(Debug)]
pub struct ExchangeMarketPrices {
    exchange_id: ExchangeId,
    prices: RwLock<HashMap<MarketId, MarketPriceTimestamp>>,
}

impl ExchangeMarketPrices {
    pub fn new(exchange_id: impl Into<ExchangeId>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    /// Store `update` unless the stored price for the market is strictly newer.
    /// Returns whether the update was applied.
    pub fn update_price(&self, update: MarketPriceTimestamp) -> bool {
        let mut prices = self.prices.write().unwrap_or_else(PoisonError::into_inner);
        match prices.get(&update.market_id) {
            Some(existing) if existing.last_updated_at > update.last_updated_at => false,
            _ => {
                prices.insert(update.market_id, update);
                true
            }
        }
    }

    pub fn get(&self, market_id: MarketId) -> Option<MarketPriceTimestamp> {
        self.prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&market_id)
            .copied()
    }

    /// Snapshot of every stored price, ordered by market id
    pub fn get_all_prices(&self) -> Vec<MarketPriceTimestamp> {
        let prices = self.prices.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = prices.values().copied().collect();
        all.sort_by_key(|p| p.market_id);
        all
    }
}

/// Every exchange's store, keyed by exchange id
#[derive(Debug, Clone)]
pub struct ExchangeToMarketPrices {
    exchanges: BTreeMap<ExchangeId, Arc<ExchangeMarketPrices>>,
    max_price_age: Duration,
}

impl ExchangeToMarketPrices {
    pub fn new<I>(exchange_ids: I, max_price_age: Duration) -> Self
    where
        I: IntoIterator<Item = ExchangeId>,
    {
        let exchanges = exchange_ids
            .into_iter()
            .map(|id| (id.clone(), Arc::new(ExchangeMarketPrices::new(id))))
            .collect();
        Self {
            exchanges,
            max_price_age,
        }
    }

    pub fn exchange(&self, exchange_id: &str) -> Option<Arc<ExchangeMarketPrices>> {
        self.exchanges.get(exchange_id).cloned()
    }

    /// Snapshot of every exchange's prices, ordered by exchange id
    pub fn get_all_prices(&self) -> BTreeMap<ExchangeId, Vec<MarketPriceTimestamp>> {
        self.exchanges
            .iter()
            .map(|(id, store)| (id.clone(), store.get_all_prices()))
            .collect()
    }

    /// Median across exchanges of the prices inside the validity window, if at
    /// least `min_exchanges` of them are.
    pub fn get_valid_median_price(
        &self,
        param: &MarketParam,
        read_time: DateTime<Utc>,
    ) -> Option<u64> {
        let valid: Vec<u64> = self
            .exchanges
            .values()
            .filter_map(|store| store.get(param.id))
            .filter(|p| within_window(p.last_updated_at, read_time, self.max_price_age))
            .map(|p| p.price)
            .collect();

        if valid.len() < param.min_exchanges as usize {
            return None;
        }
        median(&valid).ok()
    }

    pub fn get_valid_median_prices(
        &self,
        params: &[MarketParam],
        read_time: DateTime<Utc>,
    ) -> HashMap<MarketId, u64> {
        params
            .iter()
            .filter_map(|p| {
                self.get_valid_median_price(p, read_time)
                    .map(|median| (p.id, median))
            })
            .collect()
    }
}
