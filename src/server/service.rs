//! Node-side pricefeed service
//!
//! Validates update batches from the daemon, applies them to the median cache
//! and answers median queries by market or query data.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::cache::{MarketToExchangePrices, MedianWithSources};
use crate::health::HealthReporter;
use crate::time::TimeProvider;
use crate::types::{
    normalize_query_data, ExchangeId, Exponent, MarketId, MarketParam, UpdateMarketPricesRequest,
    UpdateMarketPricesResponse,
};

/// Health service name of the update endpoint
pub const PRICEFEED_SERVER_SERVICE: &str = "pricefeed-server";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateValidationError {
    #[error("market price update has length of 0")]
    EmptyBatch,
    #[error("invalid price update: market {market_id}, exchange {exchange_id}: price cannot be zero")]
    ZeroPrice {
        market_id: MarketId,
        exchange_id: ExchangeId,
    },
    #[error("invalid price update: market {market_id}, exchange {exchange_id}: last update time is not set")]
    MissingTimestamp {
        market_id: MarketId,
        exchange_id: ExchangeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MedianQueryError {
    #[error("no market configured for query data {0}")]
    UnknownQueryData(String),
    #[error("no valid median price for market {market_id} ({pair})")]
    NoValidMedian { market_id: MarketId, pair: String },
}

/// A market's current median
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MedianValue {
    pub market_id: MarketId,
    pub pair: String,
    pub query_data: String,
    pub exponent: Exponent,
    pub price: u64,
}

impl MedianValue {
    fn new(param: &MarketParam, price: u64) -> Self {
        Self {
            market_id: param.id,
            pair: param.pair.clone(),
            query_data: param.query_data_key(),
            exponent: param.exponent,
            price,
        }
    }
}

/// Check every update before anything is applied
pub fn validate_update_request(
    request: &UpdateMarketPricesRequest,
) -> Result<(), UpdateValidationError> {
    if request.is_empty() {
        return Err(UpdateValidationError::EmptyBatch);
    }

    for update in &request.market_price_updates {
        for exchange_price in &update.exchange_prices {
            if exchange_price.price == 0 {
                return Err(UpdateValidationError::ZeroPrice {
                    market_id: update.market_id,
                    exchange_id: exchange_price.exchange_id.clone(),
                });
            }
            if exchange_price.last_update_time.is_none() {
                return Err(UpdateValidationError::MissingTimestamp {
                    market_id: update.market_id,
                    exchange_id: exchange_price.exchange_id.clone(),
                });
            }
        }
    }
    Ok(())
}

pub struct PriceFeedService {
    cache: Arc<MarketToExchangePrices>,
    market_params: Arc<Vec<MarketParam>>,
    health: HealthReporter,
    clock: Arc<dyn TimeProvider>,
}

impl PriceFeedService {
    pub fn new(
        cache: Arc<MarketToExchangePrices>,
        market_params: Arc<Vec<MarketParam>>,
        health: HealthReporter,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            cache,
            market_params,
            health,
            clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn market_params(&self) -> &[MarketParam] {
        &self.market_params
    }

    pub fn cache(&self) -> &MarketToExchangePrices {
        &self.cache
    }

    /// Apply a daemon batch. Invalid batches leave the cache untouched.
    pub fn update_market_prices(
        &self,
        request: UpdateMarketPricesRequest,
    ) -> Result<UpdateMarketPricesResponse, UpdateValidationError> {
        validate_update_request(&request)?;

        self.cache.update_prices(&request.market_price_updates);
        self.health.report_success();

        debug!(
            markets = request.market_price_updates.len(),
            "Applied market price updates"
        );
        Ok(UpdateMarketPricesResponse {})
    }

    /// Valid medians of every configured market, ordered by market id
    pub fn all_median_values(&self, read_time: DateTime<Utc>) -> Vec<MedianValue> {
        let medians = self
            .cache
            .get_valid_median_prices(&self.market_params, read_time);
        let mut values: Vec<MedianValue> = self
            .market_params
            .iter()
            .filter_map(|param| medians.get(&param.id).map(|price| MedianValue::new(param, *price)))
            .collect();
        values.sort_by_key(|v| v.market_id);
        values
    }

    pub fn find_market(&self, query_data: &str) -> Result<&MarketParam, MedianQueryError> {
        let key = normalize_query_data(query_data);
        self.market_params
            .iter()
            .find(|param| param.query_data_key() == key)
            .ok_or(MedianQueryError::UnknownQueryData(key))
    }

    /// Median and sources for the market answering `query_data`
    pub fn median_with_sources(
        &self,
        query_data: &str,
        read_time: DateTime<Utc>,
    ) -> Result<(MarketParam, MedianWithSources), MedianQueryError> {
        let param = self.find_market(query_data)?;
        let mut medians = self
            .cache
            .get_valid_median_prices_with_sources(std::slice::from_ref(param), read_time);
        let median = medians
            .remove(&param.id)
            .ok_or_else(|| MedianQueryError::NoValidMedian {
                market_id: param.id,
                pair: param.pair.clone(),
            })?;
        Ok((param.clone(), median))
    }

    pub fn median_value(
        &self,
        query_data: &str,
        read_time: DateTime<Utc>,
    ) -> Result<MedianValue, MedianQueryError> {
        let (param, median) = self.median_with_sources(query_data, read_time)?;
        Ok(MedianValue::new(&param, median.median))
    }
}
