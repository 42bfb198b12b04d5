//! Exchange query handling
//!
//! Resolves market ids to tickers, issues the HTTP request, checks the status,
//! runs the exchange's price function and maps the result back to market ids.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::exchange::ExchangeQueryDetails;
use super::market_config::ExchangeMarketConfig;
use crate::time::TimeProvider;
use crate::types::{Exponent, MarketId, MarketPriceTimestamp};

/// Placeholder in exchange URLs replaced by the comma-joined tickers
pub const TICKER_PLACEHOLDER: &str = "$";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("at least one market id must be queried")]
    NoMarkets,
    #[error("no market config for market {0}")]
    MissingMarketConfig(MarketId),
    #[error("no exponent for market {0}")]
    MissingExponent(MarketId),
    #[error("status 429 - rate limit exceeded")]
    RateLimited,
    #[error("unexpected response status code: {0}")]
    UnexpectedStatus(u16),
    #[error("request failed: {0}")]
    Request(String),
    #[error("query timed out after {0}ms")]
    Timeout(u64),
    #[error("price function for {exchange} failed: {reason}")]
    PriceFunction { exchange: String, reason: String },
    #[error("severe unexpected error: no market id for ticker {0}")]
    UnknownTicker(String),
}

impl QueryError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, QueryError::RateLimited)
    }
}

/// Raw HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Performs the network side of a query
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, QueryError>;
}

/// `RequestHandler` backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestRequestHandler {
    client: reqwest::Client,
}

impl ReqwestRequestHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Request(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl RequestHandler for ReqwestRequestHandler {
    async fn get(&self, url: &str) -> Result<HttpResponse, QueryError> {
        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> QueryError {
    if e.is_timeout() {
        QueryError::Timeout(0)
    } else {
        QueryError::Request(e.to_string())
    }
}

/// Prices and unavailable markets from one query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOutcome {
    pub prices: Vec<MarketPriceTimestamp>,
    pub unavailable: HashMap<MarketId, String>,
}

#[async_trait]
pub trait ExchangeQueryHandler: Send + Sync {
    async fn query(
        &self,
        details: &ExchangeQueryDetails,
        market_config: &ExchangeMarketConfig,
        market_ids: &[MarketId],
        market_exponents: &HashMap<MarketId, Exponent>,
    ) -> Result<QueryOutcome, QueryError>;
}

/// Replace the ticker placeholder in `url` with the comma-joined tickers
pub fn create_request_url(url: &str, tickers: &[String]) -> String {
    url.replace(TICKER_PLACEHOLDER, &tickers.join(","))
}

/// Query handler that stamps prices with its clock
pub struct HttpQueryHandler {
    clock: Arc<dyn TimeProvider>,
    requests: Arc<dyn RequestHandler>,
}

impl HttpQueryHandler {
    pub fn new(clock: Arc<dyn TimeProvider>, requests: Arc<dyn RequestHandler>) -> Self {
        Self { clock, requests }
    }
}

#[async_trait]
impl ExchangeQueryHandler for HttpQueryHandler {
    async fn query(
        &self,
        details: &ExchangeQueryDetails,
        market_config: &ExchangeMarketConfig,
        market_ids: &[MarketId],
        market_exponents: &HashMap<MarketId, Exponent>,
    ) -> Result<QueryOutcome, QueryError> {
        if market_ids.is_empty() {
            return Err(QueryError::NoMarkets);
        }

        let mut tickers = Vec::with_capacity(market_ids.len());
        let mut ticker_exponents = HashMap::with_capacity(market_ids.len());
        let mut ticker_to_market = HashMap::with_capacity(market_ids.len());
        for market_id in market_ids {
            let config = market_config
                .get(*market_id)
                .ok_or(QueryError::MissingMarketConfig(*market_id))?;
            let exponent = market_exponents
                .get(market_id)
                .copied()
                .ok_or(QueryError::MissingExponent(*market_id))?;

            tickers.push(config.ticker.clone());
            ticker_exponents.insert(config.ticker.clone(), exponent);
            ticker_to_market.insert(config.ticker.clone(), *market_id);
        }

        let url = create_request_url(&details.url, &tickers);
        let response = self.requests.get(&url).await?;

        match response.status {
            429 => return Err(QueryError::RateLimited),
            200..=299 => {}
            status => return Err(QueryError::UnexpectedStatus(status)),
        }

        let (ticker_prices, unavailable_tickers) = details
            .price_function
            .parse(&response.body, &ticker_exponents)
            .map_err(|e| QueryError::PriceFunction {
                exchange: details.exchange.clone(),
                reason: e.to_string(),
            })?;

        let now = self.clock.now();
        let mut outcome = QueryOutcome::default();
        for (ticker, price) in ticker_prices {
            let market_id = ticker_to_market
                .get(&ticker)
                .copied()
                .ok_or_else(|| QueryError::UnknownTicker(ticker.clone()))?;
            outcome.prices.push(MarketPriceTimestamp {
                market_id,
                price,
                last_updated_at: now,
            });
        }
        outcome.prices.sort_by_key(|p| p.market_id);

        for (ticker, reason) in unavailable_tickers {
            let market_id = ticker_to_market
                .get(&ticker)
                .copied()
                .ok_or_else(|| QueryError::UnknownTicker(ticker.clone()))?;
            outcome.unavailable.insert(market_id, reason);
        }

        Ok(outcome)
    }
}
