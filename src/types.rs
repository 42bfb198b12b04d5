//! Core types used throughout the pricefeed
//!
//! Defines market parameters, exchange query parameters, timestamped prices
//! and the wire messages shipped from the daemon to the node.

use chrono::{DateTime, Utc};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Numeric market identifier
pub type MarketId = u32;

/// Unique string identifying an exchange (e.g. "Binance")
pub type ExchangeId = String;

/// Fixed-point price exponent. A price `p` with exponent `e` represents `p * 10^e`.
pub type Exponent = i32;

/// Upper bound (exclusive) for `MarketParam::min_price_change_ppm`
pub const MAX_PRICE_CHANGE_PPM: u32 = 10_000;

/// Validation failures for statically configured parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("pair cannot be empty (market {0})")]
    EmptyPair(MarketId),
    #[error("min exchanges must be greater than zero (market {0})")]
    ZeroMinExchanges(MarketId),
    #[error(
        "min price change in parts-per-million must be greater than 0 and less than {max} (market {market_id})"
    )]
    InvalidMinPriceChange { market_id: MarketId, max: u32 },
    #[error("exchange config json is not a valid JSON object (market {market_id}): {reason}")]
    InvalidExchangeConfigJson { market_id: MarketId, reason: String },
    #[error("query data cannot be empty (market {0})")]
    EmptyQueryData(MarketId),
    #[error("query data is not valid hex (market {market_id}): {reason}")]
    InvalidQueryData { market_id: MarketId, reason: String },
    #[error("exchange id cannot be empty")]
    EmptyExchangeId,
    #[error("{field} must be greater than zero for exchange {exchange_id}")]
    ZeroQueryParameter {
        exchange_id: ExchangeId,
        field: &'static str,
    },
}

/// Static description of a market the pricefeed tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketParam {
    /// Unique, sequentially-generated value
    pub id: MarketId,
    /// Human-readable pair (e.g. `BTC-USD`)
    pub pair: String,
    /// `10^exponent` is the smallest price step that can be recorded
    pub exponent: Exponent,
    /// Minimum number of exchanges reporting a live price for the median to be valid
    pub min_exchanges: u32,
    /// Minimum change that would cause a price update, in parts per million
    pub min_price_change_ppm: u32,
    /// JSON describing how to resolve this market on each exchange
    pub exchange_config_json: String,
    /// Hex encoded query data this market answers on-chain
    pub query_data: String,
}

impl MarketParam {
    /// Check every field invariant
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.pair.is_empty() {
            return Err(ParamError::EmptyPair(self.id));
        }

        if self.min_exchanges == 0 {
            return Err(ParamError::ZeroMinExchanges(self.id));
        }

        if self.min_price_change_ppm == 0 || self.min_price_change_ppm >= MAX_PRICE_CHANGE_PPM {
            return Err(ParamError::InvalidMinPriceChange {
                market_id: self.id,
                max: MAX_PRICE_CHANGE_PPM,
            });
        }

        match serde_json::from_str::<serde_json::Value>(&self.exchange_config_json) {
            Ok(serde_json::Value::Object(_)) => {}
            Ok(_) => {
                return Err(ParamError::InvalidExchangeConfigJson {
                    market_id: self.id,
                    reason: "expected a JSON object".to_string(),
                })
            }
            Err(e) => {
                return Err(ParamError::InvalidExchangeConfigJson {
                    market_id: self.id,
                    reason: e.to_string(),
                })
            }
        }

        if self.query_data.is_empty() {
            return Err(ParamError::EmptyQueryData(self.id));
        }
        self.query_data_bytes()?;

        Ok(())
    }

    /// Decoded query data
    pub fn query_data_bytes(&self) -> Result<Vec<u8>, ParamError> {
        let trimmed = self.query_data.trim_start_matches("0x");
        hex::decode(trimmed).map_err(|e| ParamError::InvalidQueryData {
            market_id: self.id,
            reason: e.to_string(),
        })
    }

    /// Lowercase hex query data without `0x`, used as a lookup key
    pub fn query_data_key(&self) -> String {
        normalize_query_data(&self.query_data)
    }
}

/// Lowercase a hex query data string and strip an optional `0x` prefix
pub fn normalize_query_data(query_data: &str) -> String {
    query_data.trim_start_matches("0x").to_lowercase()
}

/// On-chain query id for a query data blob
pub fn query_id_from_data(query_data: &[u8]) -> [u8; 32] {
    keccak256(query_data)
}

/// Per-exchange polling parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeQueryConfig {
    pub exchange_id: ExchangeId,
    /// Delay between task loops
    pub interval_ms: u32,
    /// Max time to wait on one API call
    pub timeout_ms: u32,
    /// Max API calls per task loop. Multi-market exchanges always make one.
    pub max_queries: u32,
}

impl ExchangeQueryConfig {
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.exchange_id.is_empty() {
            return Err(ParamError::EmptyExchangeId);
        }
        for (field, value) in [
            ("interval_ms", self.interval_ms),
            ("timeout_ms", self.timeout_ms),
            ("max_queries", self.max_queries),
        ] {
            if value == 0 {
                return Err(ParamError::ZeroQueryParameter {
                    exchange_id: self.exchange_id.clone(),
                    field,
                });
            }
        }
        Ok(())
    }
}

/// A price for one market at one point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPriceTimestamp {
    pub market_id: MarketId,
    /// Price in the market's fixed-point exponent. Zero is invalid.
    pub price: u64,
    pub last_updated_at: DateTime<Utc>,
}

/// Price reported by one exchange, as shipped to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangePrice {
    pub exchange_id: ExchangeId,
    pub price: u64,
    pub last_update_time: Option<DateTime<Utc>>,
}

impl fmt::Display for ExchangePrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_update_time {
            Some(ts) => write!(f, "{}@{}={}", self.exchange_id, ts.to_rfc3339(), self.price),
            None => write!(f, "{}@<unset>={}", self.exchange_id, self.price),
        }
    }
}

/// All exchange prices for one market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPriceUpdate {
    pub market_id: MarketId,
    pub exchange_prices: Vec<ExchangePrice>,
}

/// Batched update sent by the daemon's price updater
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMarketPricesRequest {
    pub market_price_updates: Vec<MarketPriceUpdate>,
}

impl UpdateMarketPricesRequest {
    pub fn is_empty(&self) -> bool {
        self.market_price_updates.is_empty()
    }
}

/// Empty acknowledgment returned by the update endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMarketPricesResponse {}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc_param() -> MarketParam {
        MarketParam {
            id: 1,
            pair: "BTC-USD".to_string(),
            exponent: -5,
            min_exchanges: 1,
            min_price_change_ppm: 1000,
            exchange_config_json: r#"{"exchanges":[]}"#.to_string(),
            query_data: "00AB".to_string(),
        }
    }

    #[test]
    fn valid_market_param_passes() {
        assert_eq!(btc_param().validate(), Ok(()));
    }

    #[test]
    fn market_param_rejects_each_invalid_field() {
        let mut p = btc_param();
        p.pair.clear();
        assert_eq!(p.validate(), Err(ParamError::EmptyPair(1)));

        let mut p = btc_param();
        p.min_exchanges = 0;
        assert_eq!(p.validate(), Err(ParamError::ZeroMinExchanges(1)));

        let mut p = btc_param();
        p.min_price_change_ppm = MAX_PRICE_CHANGE_PPM;
        assert!(matches!(
            p.validate(),
            Err(ParamError::InvalidMinPriceChange { .. })
        ));

        let mut p = btc_param();
        p.exchange_config_json = "[1,2]".to_string();
        assert!(matches!(
            p.validate(),
            Err(ParamError::InvalidExchangeConfigJson { .. })
        ));

        let mut p = btc_param();
        p.query_data = "zz".to_string();
        assert!(matches!(
            p.validate(),
            Err(ParamError::InvalidQueryData { .. })
        ));

        let mut p = btc_param();
        p.query_data.clear();
        assert_eq!(p.validate(), Err(ParamError::EmptyQueryData(1)));
    }

    #[test]
    fn query_data_key_is_lowercase_without_prefix() {
        let mut p = btc_param();
        p.query_data = "0xABcd".to_string();
        assert_eq!(p.query_data_key(), "abcd");
        assert_eq!(p.query_data_bytes().unwrap(), vec![0xab, 0xcd]);
    }

    #[test]
    fn exchange_query_config_requires_non_zero_fields() {
        let config = ExchangeQueryConfig {
            exchange_id: "Binance".to_string(),
            interval_ms: 2000,
            timeout_ms: 500,
            max_queries: 0,
        };
        assert_eq!(
            config.validate(),
            Err(ParamError::ZeroQueryParameter {
                exchange_id: "Binance".to_string(),
                field: "max_queries",
            })
        );
    }

    #[test]
    fn query_id_is_keccak_of_query_data() {
        let id = query_id_from_data(b"");
        assert_eq!(
            hex::encode(id),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
