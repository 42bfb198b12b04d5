//! Per-exchange price encoder
//!
//! Sole consumer of one exchange's queue. Converts query results into the
//! exchange's store, keeping only the newest price per market.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::fetcher::PriceFetcherResponse;
use super::market_config::ExchangeMarketConfig;
use super::store::{ExchangeMarketPrices, ExchangeToMarketPrices};
use crate::time::TimeProvider;
use crate::types::{ExchangeId, Exponent, MarketId, MarketParam, MarketPriceTimestamp};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("no store for exchange {0}")]
    MissingExchangeStore(ExchangeId),
    #[error("market {0} is not configured")]
    UnknownMarket(MarketId),
    #[error("price for market {0} is zero")]
    ZeroPrice(MarketId),
    #[error("price conversion for market {0} overflowed")]
    Overflow(MarketId),
    #[error("no valid median for market {adjust_by} needed to adjust market {market_id}")]
    MissingAdjustPrice { market_id: MarketId, adjust_by: MarketId },
}

fn pow10(exp: u32) -> Option<u128> {
    10u128.checked_pow(exp)
}

/// `10^(-2 * exponent) / price`, truncated. The reciprocal of a price with
/// exponent `e` expressed in the same exponent.
pub fn invert_price(market_id: MarketId, price: u64, exponent: Exponent) -> Result<u64, EncodeError> {
    if price == 0 {
        return Err(EncodeError::ZeroPrice(market_id));
    }
    let scale = exponent
        .checked_mul(-2)
        .and_then(|e| u32::try_from(e).ok())
        .and_then(pow10)
        .ok_or(EncodeError::Overflow(market_id))?;
    to_price(market_id, scale / u128::from(price))
}

/// `price * ref_price * 10^ref_exponent`, truncated
pub fn adjust_price(
    market_id: MarketId,
    price: u64,
    ref_price: u64,
    ref_exponent: Exponent,
) -> Result<u64, EncodeError> {
    let product = u128::from(price) * u128::from(ref_price);
    let factor = pow10(ref_exponent.unsigned_abs()).ok_or(EncodeError::Overflow(market_id))?;
    let adjusted = if ref_exponent < 0 {
        product / factor
    } else {
        product
            .checked_mul(factor)
            .ok_or(EncodeError::Overflow(market_id))?
    };
    to_price(market_id, adjusted)
}

fn to_price(market_id: MarketId, value: u128) -> Result<u64, EncodeError> {
    match u64::try_from(value) {
        Ok(0) => Err(EncodeError::ZeroPrice(market_id)),
        Ok(price) => Ok(price),
        Err(_) => Err(EncodeError::Overflow(market_id)),
    }
}

pub struct PriceEncoder {
    exchange_id: ExchangeId,
    market_config: Arc<ExchangeMarketConfig>,
    market_params: Arc<HashMap<MarketId, MarketParam>>,
    stores: ExchangeToMarketPrices,
    store: Arc<ExchangeMarketPrices>,
    clock: Arc<dyn TimeProvider>,
}

impl PriceEncoder {
    pub fn new(
        market_config: Arc<ExchangeMarketConfig>,
        market_params: Arc<HashMap<MarketId, MarketParam>>,
        stores: ExchangeToMarketPrices,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, EncodeError> {
        let exchange_id = market_config.exchange_id.clone();
        let store = stores
            .exchange(&exchange_id)
            .ok_or_else(|| EncodeError::MissingExchangeStore(exchange_id.clone()))?;
        Ok(Self {
            exchange_id,
            market_config,
            market_params,
            stores,
            store,
            clock,
        })
    }

    /// Apply invert then adjust-by-market to a raw ticker price
    pub fn convert_price(
        &self,
        price: MarketPriceTimestamp,
    ) -> Result<MarketPriceTimestamp, EncodeError> {
        let market_id = price.market_id;
        if price.price == 0 {
            return Err(EncodeError::ZeroPrice(market_id));
        }
        let config = self
            .market_config
            .get(market_id)
            .ok_or(EncodeError::UnknownMarket(market_id))?;
        let param = self
            .market_params
            .get(&market_id)
            .ok_or(EncodeError::UnknownMarket(market_id))?;

        let mut value = price.price;
        if config.invert {
            value = invert_price(market_id, value, param.exponent)?;
        }

        if let Some(adjust_by) = config.adjust_by_market {
            let ref_param = self
                .market_params
                .get(&adjust_by)
                .ok_or(EncodeError::UnknownMarket(adjust_by))?;
            let ref_price = self
                .stores
                .get_valid_median_price(ref_param, self.clock.now())
                .ok_or(EncodeError::MissingAdjustPrice {
                    market_id,
                    adjust_by,
                })?;
            value = adjust_price(market_id, value, ref_price, ref_param.exponent)?;
        }

        Ok(MarketPriceTimestamp {
            price: value,
            ..price
        })
    }

    /// Fold one fetcher response into the exchange store
    pub fn process_response(&self, response: PriceFetcherResponse) {
        let outcome = match response.result {
            Ok(outcome) => outcome,
            Err(e) if e.is_rate_limit() => {
                warn!(exchange = %self.exchange_id, error = %e, "Exchange rate limited price query");
                return;
            }
            Err(e) => {
                error!(exchange = %self.exchange_id, error = %e, "Failed to query exchange prices");
                return;
            }
        };

        for (market_id, reason) in &outcome.unavailable {
            debug!(exchange = %self.exchange_id, market_id, reason = %reason, "Market unavailable");
        }

        for price in outcome.prices {
            match self.convert_price(price) {
                Ok(converted) => {
                    self.store.update_price(converted);
                }
                Err(e) => {
                    error!(
                        exchange = %self.exchange_id,
                        market_id = price.market_id,
                        error = %e,
                        "Failed to encode exchange price"
                    );
                }
            }
        }
    }

    /// Drain the queue until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<PriceFetcherResponse>) {
        info!(exchange = %self.exchange_id, "Starting price encoder");
        while let Some(response) = rx.recv().await {
            self.process_response(response);
        }
        info!(exchange = %self.exchange_id, "Price queue closed, encoder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricefeed::market_config::MarketConfig;
    use crate::pricefeed::query_handler::{QueryError, QueryOutcome};
    use crate::time::ManualClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    const BTC: MarketId = 1;
    const USDT: MarketId = 2;
    const EUR: MarketId = 3;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    fn param(id: MarketId, pair: &str, exponent: Exponent) -> MarketParam {
        MarketParam {
            id,
            pair: pair.to_string(),
            exponent,
            min_exchanges: 1,
            min_price_change_ppm: 1000,
            exchange_config_json: "{}".to_string(),
            query_data: "01".to_string(),
        }
    }

    fn encoder() -> (PriceEncoder, ExchangeToMarketPrices) {
        let mut market_config = ExchangeMarketConfig::new("Binance");
        market_config.market_to_config.insert(
            BTC,
            MarketConfig {
                ticker: "BTCUSDT".to_string(),
                adjust_by_market: Some(USDT),
                invert: false,
            },
        );
        market_config.market_to_config.insert(
            EUR,
            MarketConfig {
                ticker: "USDEUR".to_string(),
                adjust_by_market: None,
                invert: true,
            },
        );

        let params = HashMap::from([
            (BTC, param(BTC, "BTC-USD", -5)),
            (USDT, param(USDT, "USDT-USD", -9)),
            (EUR, param(EUR, "EUR-USD", -5)),
        ]);
        let stores = ExchangeToMarketPrices::new(
            ["Binance".to_string(), "Kraken".to_string()],
            Duration::seconds(30),
        );
        let encoder = PriceEncoder::new(
            Arc::new(market_config),
            Arc::new(params),
            stores.clone(),
            Arc::new(ManualClock::new(now())),
        )
        .unwrap();
        (encoder, stores)
    }

    fn response(prices: Vec<MarketPriceTimestamp>) -> PriceFetcherResponse {
        PriceFetcherResponse {
            exchange_id: "Binance".to_string(),
            result: Ok(QueryOutcome {
                prices,
                unavailable: HashMap::new(),
            }),
        }
    }

    fn price(market_id: MarketId, price: u64, at: DateTime<Utc>) -> MarketPriceTimestamp {
        MarketPriceTimestamp {
            market_id,
            price,
            last_updated_at: at,
        }
    }

    #[test]
    fn invert_uses_double_exponent() {
        // 1 / 0.5 = 2 at exponent -5
        assert_eq!(invert_price(EUR, 50_000, -5), Ok(200_000));
        assert_eq!(invert_price(EUR, 0, -5), Err(EncodeError::ZeroPrice(EUR)));
        // positive exponents have no integer reciprocal
        assert_eq!(invert_price(EUR, 5, 2), Err(EncodeError::Overflow(EUR)));
    }

    #[test]
    fn adjust_scales_by_reference_exponent() {
        // 50_000 USDT * 0.999 USD/USDT
        assert_eq!(
            adjust_price(BTC, 5_000_000_000, 999_000_000, -9),
            Ok(4_995_000_000)
        );
        assert_eq!(
            adjust_price(BTC, u64::MAX, u64::MAX, 0),
            Err(EncodeError::Overflow(BTC))
        );
    }

    #[test]
    fn newest_timestamp_wins_regardless_of_delivery_order() {
        let (encoder, stores) = encoder();
        let newer = now();
        let older = now() - Duration::seconds(5);

        encoder.process_response(response(vec![price(EUR, 50_000, newer)]));
        encoder.process_response(response(vec![price(EUR, 25_000, older)]));

        let stored = stores.exchange("Binance").unwrap().get(EUR).unwrap();
        assert_eq!(stored.price, 200_000);
        assert_eq!(stored.last_updated_at, newer);
    }

    #[test]
    fn adjustment_without_reference_median_drops_only_that_market() {
        let (encoder, stores) = encoder();

        encoder.process_response(response(vec![
            price(BTC, 5_000_000_000, now()),
            price(EUR, 50_000, now()),
        ]));

        let binance = stores.exchange("Binance").unwrap();
        assert!(binance.get(BTC).is_none());
        assert!(binance.get(EUR).is_some());
    }

    #[test]
    fn adjustment_uses_reference_median_across_exchanges() {
        let (encoder, stores) = encoder();
        stores
            .exchange("Kraken")
            .unwrap()
            .update_price(price(USDT, 999_000_000, now()));

        encoder.process_response(response(vec![price(BTC, 5_000_000_000, now())]));

        let stored = stores.exchange("Binance").unwrap().get(BTC).unwrap();
        assert_eq!(stored.price, 4_995_000_000);
    }

    #[test]
    fn failed_responses_and_zero_prices_leave_the_store_untouched() {
        let (encoder, stores) = encoder();

        encoder.process_response(PriceFetcherResponse {
            exchange_id: "Binance".to_string(),
            result: Err(QueryError::RateLimited),
        });
        encoder.process_response(response(vec![price(EUR, 0, now())]));

        assert!(stores.exchange("Binance").unwrap().get_all_prices().is_empty());
    }

    #[tokio::test]
    async fn run_exits_when_queue_closes() {
        let (encoder, stores) = encoder();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(encoder.run(rx));

        tx.send(response(vec![price(EUR, 50_000, now())])).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(stores.exchange("Binance").unwrap().get(EUR).unwrap().price, 200_000);
    }
}
