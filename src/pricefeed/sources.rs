//! Built-in response formats
//!
//! Only the exchange-agnostic `ticker_map` format lives here: a JSON object
//! mapping ticker to a decimal price, e.g. `{"BTCUSD":"50000.25","ETHUSD":3000}`.
//! Exchange-specific parsers plug in through `ExchangeRegistry`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use super::exchange::{ParsedPrices, PriceFunction, PriceFunctionError};
use crate::types::Exponent;

/// Response formats selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    TickerMap,
}

impl ResponseFormat {
    pub fn price_function(self) -> Arc<dyn PriceFunction> {
        match self {
            ResponseFormat::TickerMap => Arc::new(ticker_map_price_function),
        }
    }
}

/// Scale a decimal price into fixed point with the given exponent, truncating
/// digits finer than `10^exponent`.
pub fn parse_decimal_price(raw: Decimal, exponent: Exponent) -> Result<u64, PriceFunctionError> {
    if raw.is_sign_negative() || raw.is_zero() {
        return Err(PriceFunctionError::new(format!(
            "price must be positive, got {}",
            raw
        )));
    }

    let mut factor = Decimal::ONE;
    for _ in 0..exponent.unsigned_abs() {
        factor = factor
            .checked_mul(Decimal::TEN)
            .ok_or_else(|| PriceFunctionError::new(format!("exponent {} out of range", exponent)))?;
    }

    let scaled = if exponent <= 0 {
        raw.checked_mul(factor)
    } else {
        raw.checked_div(factor)
    }
    .ok_or_else(|| PriceFunctionError::new(format!("price {} overflows at exponent {}", raw, exponent)))?;

    match scaled.trunc().to_u64() {
        Some(0) => Err(PriceFunctionError::new(format!(
            "price {} is below the smallest step at exponent {}",
            raw, exponent
        ))),
        Some(price) => Ok(price),
        None => Err(PriceFunctionError::new(format!(
            "price {} does not fit in u64 at exponent {}",
            raw, exponent
        ))),
    }
}

fn decimal_from_json(value: &serde_json::Value) -> Result<Decimal, String> {
    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        other => return Err(format!("expected a decimal price, got {}", other)),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| format!("invalid decimal {:?}: {}", text, e))
}

/// Price function for the `ticker_map` format. Requested tickers missing from
/// the body or carrying an unusable value are reported as unavailable.
pub fn ticker_map_price_function(
    body: &[u8],
    ticker_exponents: &HashMap<String, Exponent>,
) -> Result<ParsedPrices, PriceFunctionError> {
    let parsed: HashMap<String, serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| PriceFunctionError::new(format!("invalid ticker map body: {}", e)))?;

    let mut prices = HashMap::with_capacity(ticker_exponents.len());
    let mut unavailable = HashMap::new();

    for (ticker, exponent) in ticker_exponents {
        let Some(value) = parsed.get(ticker) else {
            unavailable.insert(ticker.clone(), "ticker not found in response".to_string());
            continue;
        };

        let price = decimal_from_json(value)
            .and_then(|raw| parse_decimal_price(raw, *exponent).map_err(|e| e.to_string()));

        match price {
            Ok(price) => {
                prices.insert(ticker.clone(), price);
            }
            Err(reason) => {
                unavailable.insert(ticker.clone(), reason);
            }
        }
    }

    Ok((prices, unavailable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn scales_to_negative_exponent_and_truncates() {
        assert_eq!(parse_decimal_price(dec!(50000.123456), -5), Ok(5_000_012_345));
        assert_eq!(parse_decimal_price(dec!(1.5), 0), Ok(1));
    }

    #[test]
    fn scales_to_positive_exponent() {
        assert_eq!(parse_decimal_price(dec!(123456), 2), Ok(1234));
    }

    #[test]
    fn rejects_zero_negative_and_sub_step_prices() {
        assert!(parse_decimal_price(dec!(0), -5).is_err());
        assert!(parse_decimal_price(dec!(-1), -5).is_err());
        assert!(parse_decimal_price(dec!(0.000001), -5).is_err());
    }

    #[test]
    fn ticker_map_splits_prices_and_unavailable() {
        let body = br#"{"BTCUSD":"50000.5","ETHUSD":3000,"SOLUSD":"n/a","EXTRA":"1"}"#;
        let exponents: HashMap<String, Exponent> = [
            ("BTCUSD".to_string(), -5),
            ("ETHUSD".to_string(), -6),
            ("SOLUSD".to_string(), -6),
            ("DOGEUSD".to_string(), -9),
        ]
        .into_iter()
        .collect();

        let (prices, unavailable) = ticker_map_price_function(body, &exponents).unwrap();

        assert_eq!(prices.len(), 2);
        assert_eq!(prices["BTCUSD"], 5_000_050_000);
        assert_eq!(prices["ETHUSD"], 3_000_000_000);
        assert!(unavailable.contains_key("SOLUSD"));
        assert!(unavailable.contains_key("DOGEUSD"));
        assert!(!prices.contains_key("EXTRA"));
    }

    #[test]
    fn ticker_map_rejects_non_object_body() {
        let exponents = HashMap::from([("BTCUSD".to_string(), -5)]);
        assert!(ticker_map_price_function(b"[1,2,3]", &exponents).is_err());
    }
}
