//! Authoritative median cache
//!
//! Holds the latest price every exchange reported for every market, as shipped
//! by the daemon, and answers staleness- and quorum-aware median queries.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use crate::median::{median, within_window};
use crate::types::{ExchangeId, MarketId, MarketParam, MarketPriceUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PriceTimestamp {
    price: u64,
    last_update_time: DateTime<Utc>,
}

/// One exchange's contribution to a median
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePrice {
    pub exchange_id: ExchangeId,
    pub price: u64,
}

/// A valid median together with the prices it was computed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MedianWithSources {
    pub median: u64,
    pub sources: Vec<SourcePrice>,
}

#[derive(Debug)]
pub struct MarketToExchangePrices {
    markets: Mutex<HashMap<MarketId, BTreeMap<ExchangeId, PriceTimestamp>>>,
    max_price_age: Duration,
}

impl MarketToExchangePrices {
    pub fn new(max_price_age: std::time::Duration) -> Self {
        Self {
            markets: Mutex::new(HashMap::new()),
            max_price_age: crate::time::to_chrono(max_price_age),
        }
    }

    /// Store every exchange price. Writes are unconditional: a price with an
    /// older timestamp still replaces the stored one. Prices without an update
    /// time are skipped.
    pub fn update_prices(&self, updates: &[MarketPriceUpdate]) {
        let mut markets = self.markets.lock().unwrap_or_else(PoisonError::into_inner);
        for update in updates {
            let exchanges = markets.entry(update.market_id).or_default();
            for exchange_price in &update.exchange_prices {
                let Some(last_update_time) = exchange_price.last_update_time else {
                    continue;
                };
                exchanges.insert(
                    exchange_price.exchange_id.clone(),
                    PriceTimestamp {
                        price: exchange_price.price,
                        last_update_time,
                    },
                );
            }
        }
    }

    /// Valid medians with their sources. Markets below quorum are omitted.
    pub fn get_valid_median_prices_with_sources(
        &self,
        market_params: &[MarketParam],
        read_time: DateTime<Utc>,
    ) -> HashMap<MarketId, MedianWithSources> {
        let collected: Vec<(MarketId, Vec<SourcePrice>)> = {
            let markets = self.markets.lock().unwrap_or_else(PoisonError::into_inner);
            market_params
                .iter()
                .filter_map(|param| {
                    let exchanges = markets.get(&param.id)?;
                    let valid: Vec<SourcePrice> = exchanges
                        .iter()
                        .filter(|(_, p)| within_window(p.last_update_time, read_time, self.max_price_age))
                        .map(|(exchange_id, p)| SourcePrice {
                            exchange_id: exchange_id.clone(),
                            price: p.price,
                        })
                        .collect();
                    (valid.len() >= param.min_exchanges as usize).then_some((param.id, valid))
                })
                .collect()
        };

        collected
            .into_iter()
            .filter_map(|(market_id, sources)| {
                let prices: Vec<u64> = sources.iter().map(|s| s.price).collect();
                let median = median(&prices).ok()?;
                Some((market_id, MedianWithSources { median, sources }))
            })
            .collect()
    }

    pub fn get_valid_median_prices(
        &self,
        market_params: &[MarketParam],
        read_time: DateTime<Utc>,
    ) -> HashMap<MarketId, u64> {
        self.get_valid_median_prices_with_sources(market_params, read_time)
            .into_iter()
            .map(|(market_id, m)| (market_id, m.median))
            .collect()
    }
}
