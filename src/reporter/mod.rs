//! Reporter read path
//!
//! Resolves query data to a market, reads its valid median, applies the
//! submission guard and hands the encoded value to the report sink.

pub mod encoding;
pub mod price_guard;

pub use encoding::{encode_price, price_to_f64, EncodingError};
pub use price_guard::{query_id_hex, GuardDecision, PriceGuard, PriceGuardOptions};

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::server::{MedianQueryError, PriceFeedService};
use crate::types::{Exponent, MarketId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("report sink failed: {0}")]
pub struct SinkError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReporterError {
    #[error(transparent)]
    Median(#[from] MedianQueryError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A spot price ready for broadcast
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotReport {
    pub market_id: MarketId,
    pub pair: String,
    pub query_data: String,
    pub query_id: String,
    pub median: u64,
    pub exponent: Exponent,
    pub price: f64,
    /// ABI-encoded uint256, hex
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    Submitted(SpotReport),
    Blocked(String),
}

/// Receives finished reports; implemented by the transaction broadcaster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, report: SpotReport) -> Result<(), SinkError>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MedianLogData<'a> {
    pair: &'a str,
    source_data: Vec<SourceLogPrice<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SourceLogPrice<'a> {
    exchange: &'a str,
    price: f64,
}

pub struct SpotPriceReporter {
    service: Arc<PriceFeedService>,
    guard: Arc<PriceGuard>,
    sink: Arc<dyn ReportSink>,
}

impl SpotPriceReporter {
    pub fn new(
        service: Arc<PriceFeedService>,
        guard: Arc<PriceGuard>,
        sink: Arc<dyn ReportSink>,
    ) -> Self {
        Self {
            service,
            guard,
            sink,
        }
    }

    pub async fn report(&self, query_data: &[u8]) -> Result<ReportOutcome, ReporterError> {
        let query_data_hex = hex::encode(query_data);
        let (param, median) = self
            .service
            .median_with_sources(&query_data_hex, self.service.now())?;

        let log_data = MedianLogData {
            pair: &param.pair,
            source_data: median
                .sources
                .iter()
                .map(|s| SourceLogPrice {
                    exchange: &s.exchange_id,
                    price: price_to_f64(s.price, param.exponent),
                })
                .collect(),
        };
        match serde_json::to_string(&log_data) {
            Ok(json) => info!(data = %json, "Median price source data"),
            Err(e) => error!(error = %e, "Failed to marshal median log data"),
        }

        let price = price_to_f64(median.median, param.exponent);
        info!(pair = %param.pair, price, "Median value");

        if let GuardDecision::Block(reason) = self.guard.should_submit(query_data, price) {
            if self.guard.update_on_block() {
                self.guard.update_last_price(query_data, price);
            }
            return Ok(ReportOutcome::Blocked(reason));
        }

        let report = SpotReport {
            market_id: param.id,
            pair: param.pair.clone(),
            query_data: query_data_hex,
            query_id: query_id_hex(query_data),
            median: median.median,
            exponent: param.exponent,
            price,
            value: encode_price(median.median, param.exponent)?,
        };
        self.sink.submit(report.clone()).await?;
        self.guard.update_last_price(query_data, price);

        Ok(ReportOutcome::Submitted(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthMonitor;
    use crate::server::{MarketToExchangePrices, PRICEFEED_SERVER_SERVICE};
    use crate::time::ManualClock;
    use crate::types::{ExchangePrice, MarketParam, MarketPriceUpdate, UpdateMarketPricesRequest};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    const QUERY_DATA: [u8; 2] = [0xab, 0xcd];

    fn service() -> Arc<PriceFeedService> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        ));
        let monitor = Arc::new(HealthMonitor::new(Duration::ZERO, clock.clone()));
        let reporter = monitor
            .register_service(PRICEFEED_SERVER_SERVICE, Duration::from_secs(300))
            .unwrap();
        let params = vec![MarketParam {
            id: 1,
            pair: "BTC-USD".to_string(),
            exponent: -5,
            min_exchanges: 1,
            min_price_change_ppm: 1000,
            exchange_config_json: "{}".to_string(),
            query_data: "ABCD".to_string(),
        }];
        Arc::new(PriceFeedService::new(
            Arc::new(MarketToExchangePrices::new(Duration::from_secs(30))),
            Arc::new(params),
            reporter,
            clock,
        ))
    }

    fn set_price(service: &PriceFeedService, price: u64) {
        service
            .update_market_prices(UpdateMarketPricesRequest {
                market_price_updates: vec![MarketPriceUpdate {
                    market_id: 1,
                    exchange_prices: vec![ExchangePrice {
                        exchange_id: "Binance".to_string(),
                        price,
                        last_update_time: Some(service.now()),
                    }],
                }],
            })
            .unwrap();
    }

    fn guard(update_on_block: bool) -> Arc<PriceGuard> {
        Arc::new(PriceGuard::new(
            PriceGuardOptions {
                update_on_block,
                ..PriceGuardOptions::default()
            },
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            )),
        ))
    }

    #[tokio::test]
    async fn submits_encoded_median_and_moves_baseline() {
        let service = service();
        set_price(&service, 5_020_000_000);
        let guard = guard(false);

        let mut sink = MockReportSink::new();
        sink.expect_submit()
            .withf(|report| report.pair == "BTC-USD" && report.value.len() == 64)
            .times(1)
            .returning(|_| Ok(()));

        let reporter = SpotPriceReporter::new(service, guard.clone(), Arc::new(sink));
        match reporter.report(&QUERY_DATA).await.unwrap() {
            ReportOutcome::Submitted(report) => {
                assert_eq!(report.median, 5_020_000_000);
                assert_eq!(report.query_data, "abcd");
                assert!((report.price - 50_200.0).abs() < 1e-6);
            }
            other => panic!("expected submission, got {:?}", other),
        }
        assert_eq!(guard.last_price(&QUERY_DATA), Some(50_200.0));
    }

    #[tokio::test]
    async fn blocked_price_is_not_submitted() {
        let service = service();
        set_price(&service, 10_000_000);
        let guard = guard(false);
        guard.update_last_price(&QUERY_DATA, 50.0);

        let mut sink = MockReportSink::new();
        sink.expect_submit().never();

        let reporter = SpotPriceReporter::new(service, guard.clone(), Arc::new(sink));
        let outcome = reporter.report(&QUERY_DATA).await.unwrap();

        assert!(matches!(outcome, ReportOutcome::Blocked(_)));
        assert_eq!(guard.last_price(&QUERY_DATA), Some(50.0));
    }

    #[tokio::test]
    async fn update_on_block_moves_baseline() {
        let service = service();
        set_price(&service, 10_000_000);
        let guard = guard(true);
        guard.update_last_price(&QUERY_DATA, 50.0);

        let mut sink = MockReportSink::new();
        sink.expect_submit().never();

        let reporter = SpotPriceReporter::new(service, guard.clone(), Arc::new(sink));
        reporter.report(&QUERY_DATA).await.unwrap();

        assert_eq!(guard.last_price(&QUERY_DATA), Some(100.0));
    }

    #[tokio::test]
    async fn missing_median_is_an_error() {
        let reporter = SpotPriceReporter::new(service(), guard(false), Arc::new(MockReportSink::new()));
        assert!(matches!(
            reporter.report(&QUERY_DATA).await,
            Err(ReporterError::Median(MedianQueryError::NoValidMedian { .. }))
        ));
    }

    #[tokio::test]
    async fn sink_failure_keeps_baseline() {
        let service = service();
        set_price(&service, 5_020_000_000);
        let guard = guard(false);

        let mut sink = MockReportSink::new();
        sink.expect_submit()
            .returning(|_| Err(SinkError("broadcast failed".to_string())));

        let reporter = SpotPriceReporter::new(service, guard.clone(), Arc::new(sink));
        assert!(matches!(
            reporter.report(&QUERY_DATA).await,
            Err(ReporterError::Sink(_))
        ));
        assert_eq!(guard.last_price(&QUERY_DATA), None);
    }
}
