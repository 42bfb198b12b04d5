//! Daemon-side price updater
//!
//! Snapshots every exchange store on a fixed interval and ships the result to
//! the node in one batch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::store::ExchangeToMarketPrices;
use super::transport::{PriceFeedServiceClient, TransportError};
use crate::health::HealthReporter;
use crate::types::{
    ExchangeId, ExchangePrice, MarketId, MarketPriceTimestamp, MarketPriceUpdate,
    UpdateMarketPricesRequest,
};

/// Health service name of the updater loop
pub const PRICE_UPDATER_SERVICE: &str = "pricefeed-daemon";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdaterError {
    #[error("market price update has length of 0")]
    EmptyMarketPriceUpdate,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Invert `exchange -> prices` into one update per market. Markets are
/// ordered by id and exchanges by id within each market.
pub fn transform_price_updates(
    snapshot: &BTreeMap<ExchangeId, Vec<MarketPriceTimestamp>>,
) -> UpdateMarketPricesRequest {
    let mut by_market: BTreeMap<MarketId, Vec<ExchangePrice>> = BTreeMap::new();
    for (exchange_id, prices) in snapshot {
        for price in prices {
            by_market
                .entry(price.market_id)
                .or_default()
                .push(ExchangePrice {
                    exchange_id: exchange_id.clone(),
                    price: price.price,
                    last_update_time: Some(price.last_updated_at),
                });
        }
    }

    UpdateMarketPricesRequest {
        market_price_updates: by_market
            .into_iter()
            .map(|(market_id, exchange_prices)| MarketPriceUpdate {
                market_id,
                exchange_prices,
            })
            .collect(),
    }
}

/// Snapshot, transform and send once. An empty snapshot is not sent.
pub async fn run_price_updater_task_loop(
    stores: &ExchangeToMarketPrices,
    client: &dyn PriceFeedServiceClient,
) -> Result<(), UpdaterError> {
    let request = transform_price_updates(&stores.get_all_prices());
    if request.is_empty() {
        return Err(UpdaterError::EmptyMarketPriceUpdate);
    }

    let markets = request.market_price_updates.len();
    client.update_market_prices(request).await?;
    debug!(markets, "Sent market price update");
    Ok(())
}

pub struct PriceUpdater {
    stores: ExchangeToMarketPrices,
    client: Arc<dyn PriceFeedServiceClient>,
    health: HealthReporter,
    interval: Duration,
}

impl PriceUpdater {
    pub fn new(
        stores: ExchangeToMarketPrices,
        client: Arc<dyn PriceFeedServiceClient>,
        health: HealthReporter,
        interval: Duration,
    ) -> Self {
        Self {
            stores,
            client,
            health,
            interval,
        }
    }

    /// One update round with health reporting
    pub async fn tick(&self) -> Result<(), UpdaterError> {
        let result = run_price_updater_task_loop(&self.stores, self.client.as_ref()).await;
        match &result {
            Ok(()) => self.health.report_success(),
            Err(UpdaterError::EmptyMarketPriceUpdate) => {
                info!("No exchange prices available yet, skipping update");
            }
            Err(e) => {
                error!(error = %e, "Failed to send market price update");
                self.health.report_failure(e);
            }
        }
        result
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Starting price updater");

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.tick().await;
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Price updater stopped");
    }
}
