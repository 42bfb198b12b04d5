//! Per-exchange market configuration
//!
//! Each market carries a JSON blob describing the ticker to query on every
//! exchange that lists it:
//!
//! ```json
//! {"exchanges":[{"exchangeName":"Binance","ticker":"BTCUSDT","adjustByMarket":"USDT-USD"}]}
//! ```
//!
//! This module turns the market-centric blobs into exchange-centric maps.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::types::{ExchangeId, Exponent, MarketId, MarketParam, ParamError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarketConfigError {
    #[error(transparent)]
    InvalidParam(#[from] ParamError),
    #[error("market id {0} is configured more than once")]
    DuplicateMarketId(MarketId),
    #[error("exchange config json for market {market_id} could not be parsed: {reason}")]
    Json { market_id: MarketId, reason: String },
    #[error("market {market_id} lists exchange {exchange_id} more than once")]
    DuplicateExchange {
        market_id: MarketId,
        exchange_id: ExchangeId,
    },
    #[error("market {market_id} has an empty ticker for exchange {exchange_id}")]
    EmptyTicker {
        market_id: MarketId,
        exchange_id: ExchangeId,
    },
    #[error("market {market_id} adjusts by unknown market pair {pair}")]
    UnknownAdjustByMarket { market_id: MarketId, pair: String },
    #[error("market {0} cannot be adjusted by itself")]
    SelfAdjustment(MarketId),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeConfigJson {
    exchanges: Vec<ExchangeMarketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeMarketEntry {
    exchange_name: String,
    ticker: String,
    #[serde(default)]
    adjust_by_market: Option<String>,
    #[serde(default)]
    invert: bool,
}

/// How one market is resolved on one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub ticker: String,
    /// Market whose median converts the ticker's quote currency
    pub adjust_by_market: Option<MarketId>,
    /// The exchange quotes the reciprocal of the market price
    pub invert: bool,
}

/// Markets supported by one exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeMarketConfig {
    pub exchange_id: ExchangeId,
    pub market_to_config: BTreeMap<MarketId, MarketConfig>,
}

impl ExchangeMarketConfig {
    pub fn new(exchange_id: impl Into<ExchangeId>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            market_to_config: BTreeMap::new(),
        }
    }

    /// Market ids in ascending order
    pub fn market_ids(&self) -> Vec<MarketId> {
        self.market_to_config.keys().copied().collect()
    }

    pub fn get(&self, market_id: MarketId) -> Option<&MarketConfig> {
        self.market_to_config.get(&market_id)
    }
}

/// Validate every market and invert the per-market exchange JSON into
/// `exchange id -> ExchangeMarketConfig`.
pub fn build_exchange_market_configs(
    params: &[MarketParam],
) -> Result<HashMap<ExchangeId, ExchangeMarketConfig>, MarketConfigError> {
    let mut pair_to_id: HashMap<&str, MarketId> = HashMap::with_capacity(params.len());
    for param in params {
        param.validate()?;
        if pair_to_id.values().any(|id| *id == param.id) {
            return Err(MarketConfigError::DuplicateMarketId(param.id));
        }
        pair_to_id.insert(param.pair.as_str(), param.id);
    }

    let mut configs: HashMap<ExchangeId, ExchangeMarketConfig> = HashMap::new();
    for param in params {
        let parsed: ExchangeConfigJson = serde_json::from_str(&param.exchange_config_json)
            .map_err(|e| MarketConfigError::Json {
                market_id: param.id,
                reason: e.to_string(),
            })?;

        for entry in parsed.exchanges {
            if entry.ticker.is_empty() {
                return Err(MarketConfigError::EmptyTicker {
                    market_id: param.id,
                    exchange_id: entry.exchange_name,
                });
            }

            let adjust_by_market = match entry.adjust_by_market.as_deref() {
                None | Some("") => None,
                Some(pair) => {
                    let id = pair_to_id.get(pair).copied().ok_or_else(|| {
                        MarketConfigError::UnknownAdjustByMarket {
                            market_id: param.id,
                            pair: pair.to_string(),
                        }
                    })?;
                    if id == param.id {
                        return Err(MarketConfigError::SelfAdjustment(param.id));
                    }
                    Some(id)
                }
            };

            let exchange = configs
                .entry(entry.exchange_name.clone())
                .or_insert_with(|| ExchangeMarketConfig::new(entry.exchange_name.clone()));

            if exchange.market_to_config.contains_key(&param.id) {
                return Err(MarketConfigError::DuplicateExchange {
                    market_id: param.id,
                    exchange_id: entry.exchange_name,
                });
            }

            exchange.market_to_config.insert(
                param.id,
                MarketConfig {
                    ticker: entry.ticker,
                    adjust_by_market,
                    invert: entry.invert,
                },
            );
        }
    }

    Ok(configs)
}

/// `market id -> exponent` for every configured market
pub fn market_exponents(params: &[MarketParam]) -> HashMap<MarketId, Exponent> {
    params.iter().map(|p| (p.id, p.exponent)).collect()
}
