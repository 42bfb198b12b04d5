//! Exchange query details and the registry that resolves them by id

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{ExchangeId, Exponent};

/// Ticker prices and unavailable tickers extracted from one response body
pub type ParsedPrices = (HashMap<String, u64>, HashMap<String, String>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PriceFunctionError(pub String);

impl PriceFunctionError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Pure translation of a response body into ticker prices.
///
/// `ticker_exponents` holds the exponent each requested ticker must be
/// expressed in. Tickers the exchange reports as unavailable go in the second
/// map with a reason.
pub trait PriceFunction: Send + Sync {
    fn parse(
        &self,
        body: &[u8],
        ticker_exponents: &HashMap<String, Exponent>,
    ) -> Result<ParsedPrices, PriceFunctionError>;
}

impl<F> PriceFunction for F
where
    F: Fn(&[u8], &HashMap<String, Exponent>) -> Result<ParsedPrices, PriceFunctionError>
        + Send
        + Sync,
{
    fn parse(
        &self,
        body: &[u8],
        ticker_exponents: &HashMap<String, Exponent>,
    ) -> Result<ParsedPrices, PriceFunctionError> {
        self(body, ticker_exponents)
    }
}

/// How to query one exchange
#[derive(Clone)]
pub struct ExchangeQueryDetails {
    pub exchange: ExchangeId,
    /// Endpoint with a `$` placeholder for the comma-joined tickers
    pub url: String,
    pub price_function: Arc<dyn PriceFunction>,
    /// One request covers every market
    pub is_multi_market: bool,
}

impl fmt::Debug for ExchangeQueryDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeQueryDetails")
            .field("exchange", &self.exchange)
            .field("url", &self.url)
            .field("is_multi_market", &self.is_multi_market)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("exchange {0} is already registered")]
    AlreadyRegistered(ExchangeId),
    #[error("exchange {0} is not registered")]
    UnknownExchange(ExchangeId),
}

/// Explicit registry of supported exchanges, passed to the daemon by handle
#[derive(Debug, Clone, Default)]
pub struct ExchangeRegistry {
    exchanges: HashMap<ExchangeId, ExchangeQueryDetails>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, details: ExchangeQueryDetails) -> Result<(), RegistryError> {
        if self.exchanges.contains_key(&details.exchange) {
            return Err(RegistryError::AlreadyRegistered(details.exchange));
        }
        self.exchanges.insert(details.exchange.clone(), details);
        Ok(())
    }

    pub fn get(&self, exchange_id: &str) -> Result<&ExchangeQueryDetails, RegistryError> {
        self.exchanges
            .get(exchange_id)
            .ok_or_else(|| RegistryError::UnknownExchange(exchange_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
