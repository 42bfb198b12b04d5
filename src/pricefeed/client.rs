//! Pricefeed daemon wiring
//!
//! Starts one fetcher and one encoder per exchange plus the shared updater,
//! all stopped through one watch channel.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::encoder::{EncodeError, PriceEncoder};
use super::exchange::{ExchangeRegistry, RegistryError};
use super::fetcher::{FetcherError, PriceFetcher, DEFAULT_QUEUE_BUFFER};
use super::market_config::{build_exchange_market_configs, market_exponents, MarketConfigError};
use super::query_handler::ExchangeQueryHandler;
use super::store::ExchangeToMarketPrices;
use super::transport::PriceFeedServiceClient;
use super::updater::{PriceUpdater, PRICE_UPDATER_SERVICE};
use crate::health::{HealthCheckError, HealthMonitor};
use crate::time::{to_chrono, TimeProvider};
use crate::types::{ExchangeId, ExchangeQueryConfig, MarketParam};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DaemonError {
    #[error(transparent)]
    MarketConfig(#[from] MarketConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Fetcher(#[from] FetcherError),
    #[error(transparent)]
    Encoder(#[from] EncodeError),
    #[error(transparent)]
    Health(#[from] HealthCheckError),
    #[error("exchange {0} has markets configured but no query config")]
    MissingQueryConfig(ExchangeId),
}

/// Static daemon parameters
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub market_params: Vec<MarketParam>,
    pub exchange_query_configs: Vec<ExchangeQueryConfig>,
    pub update_interval: Duration,
    /// Age after which a local price no longer counts towards adjust-by medians
    pub max_price_age: Duration,
    pub queue_buffer: usize,
    /// Unhealthy budget of the updater service
    pub max_unhealthy: Duration,
}

impl DaemonConfig {
    pub fn new(market_params: Vec<MarketParam>, exchange_query_configs: Vec<ExchangeQueryConfig>) -> Self {
        Self {
            market_params,
            exchange_query_configs,
            update_interval: Duration::from_millis(3_000),
            max_price_age: Duration::from_secs(30),
            queue_buffer: DEFAULT_QUEUE_BUFFER,
            max_unhealthy: Duration::from_secs(300),
        }
    }
}

/// External dependencies the daemon runs against
pub struct DaemonDeps {
    pub registry: ExchangeRegistry,
    pub query_handler: Arc<dyn ExchangeQueryHandler>,
    pub client: Arc<dyn PriceFeedServiceClient>,
    pub health: Arc<HealthMonitor>,
    pub clock: Arc<dyn TimeProvider>,
}

pub struct PriceFeedDaemon {
    stop_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    stores: ExchangeToMarketPrices,
}

impl PriceFeedDaemon {
    /// Validate everything, then spawn the loops. Nothing is spawned on error.
    pub fn start(config: DaemonConfig, deps: DaemonDeps) -> Result<Self, DaemonError> {
        let market_configs = build_exchange_market_configs(&config.market_params)?;
        let exponents = Arc::new(market_exponents(&config.market_params));
        let params_by_id: Arc<HashMap<_, _>> = Arc::new(
            config
                .market_params
                .iter()
                .map(|p| (p.id, p.clone()))
                .collect(),
        );

        let query_configs: HashMap<&str, &ExchangeQueryConfig> = config
            .exchange_query_configs
            .iter()
            .map(|c| (c.exchange_id.as_str(), c))
            .collect();
        if let Some(orphan) = market_configs
            .keys()
            .find(|id| !query_configs.contains_key(id.as_str()))
        {
            return Err(DaemonError::MissingQueryConfig(orphan.clone()));
        }

        let stores = ExchangeToMarketPrices::new(
            market_configs.keys().cloned(),
            to_chrono(config.max_price_age),
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut pipelines = Vec::with_capacity(market_configs.len());
        for query_config in &config.exchange_query_configs {
            let Some(market_config) = market_configs.get(&query_config.exchange_id) else {
                warn!(exchange = %query_config.exchange_id, "Exchange has no markets configured, not polling");
                continue;
            };
            let market_config = Arc::new(market_config.clone());
            let details = deps.registry.get(&query_config.exchange_id)?.clone();

            let (tx, rx) = mpsc::channel(config.queue_buffer.max(1));
            let fetcher = PriceFetcher::new(
                query_config.clone(),
                details,
                Arc::clone(&market_config),
                Arc::clone(&exponents),
                Arc::clone(&deps.query_handler),
                tx,
            )?;
            let encoder = PriceEncoder::new(
                market_config,
                Arc::clone(&params_by_id),
                stores.clone(),
                Arc::clone(&deps.clock),
            )?;
            pipelines.push((fetcher, encoder, rx));
        }

        let reporter = deps
            .health
            .register_service(PRICE_UPDATER_SERVICE, config.max_unhealthy)?;
        let updater = PriceUpdater::new(
            stores.clone(),
            deps.client,
            reporter,
            config.update_interval,
        );

        let mut handles = Vec::with_capacity(pipelines.len() * 2 + 1);
        let exchanges = pipelines.len();
        for (fetcher, encoder, rx) in pipelines {
            handles.push(tokio::spawn(encoder.run(rx)));
            handles.push(tokio::spawn(fetcher.run(stop_rx.clone())));
        }
        handles.push(tokio::spawn(updater.run(stop_rx)));

        info!(
            exchanges,
            markets = config.market_params.len(),
            "🚀 Pricefeed daemon started"
        );

        Ok(Self {
            stop_tx,
            handles,
            stores,
        })
    }

    pub fn stores(&self) -> &ExchangeToMarketPrices {
        &self.stores
    }

    /// Signal every loop and wait for them to drain
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Pricefeed daemon task ended abnormally");
            }
        }
        info!("Pricefeed daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricefeed::exchange::ExchangeQueryDetails;
    use crate::pricefeed::query_handler::{HttpQueryHandler, MockRequestHandler};
    use crate::pricefeed::sources::ticker_map_price_function;
    use crate::pricefeed::transport::MockPriceFeedServiceClient;
    use crate::time::SystemClock;

    fn market() -> MarketParam {
        MarketParam {
            id: 1,
            pair: "BTC-USD".to_string(),
            exponent: -5,
            min_exchanges: 1,
            min_price_change_ppm: 1000,
            exchange_config_json: r#"{"exchanges":[{"exchangeName":"TestExchange","ticker":"BTCUSD"}]}"#
                .to_string(),
            query_data: "01".to_string(),
        }
    }

    fn query_config() -> ExchangeQueryConfig {
        ExchangeQueryConfig {
            exchange_id: "TestExchange".to_string(),
            interval_ms: 10,
            timeout_ms: 100,
            max_queries: 1,
        }
    }

    fn deps(registered: bool, client: MockPriceFeedServiceClient) -> DaemonDeps {
        let mut registry = ExchangeRegistry::new();
        if registered {
            registry
                .register(ExchangeQueryDetails {
                    exchange: "TestExchange".to_string(),
                    url: "http://test/$".to_string(),
                    price_function: Arc::new(ticker_map_price_function),
                    is_multi_market: true,
                })
                .unwrap();
        }
        let mut requests = MockRequestHandler::new();
        requests.expect_get().returning(|_| {
            Ok(crate::pricefeed::query_handler::HttpResponse {
                status: 200,
                body: br#"{"BTCUSD":"50000"}"#.to_vec(),
            })
        });
        let clock: Arc<dyn TimeProvider> = Arc::new(SystemClock);
        DaemonDeps {
            registry,
            query_handler: Arc::new(HttpQueryHandler::new(clock.clone(), Arc::new(requests))),
            client: Arc::new(client),
            health: Arc::new(HealthMonitor::new(Duration::ZERO, clock.clone())),
            clock,
        }
    }

    #[tokio::test]
    async fn unknown_exchange_fails_startup() {
        let result = PriceFeedDaemon::start(
            DaemonConfig::new(vec![market()], vec![query_config()]),
            deps(false, MockPriceFeedServiceClient::new()),
        );
        assert!(matches!(
            result,
            Err(DaemonError::Registry(RegistryError::UnknownExchange(_)))
        ));
    }

    #[tokio::test]
    async fn exchange_without_query_config_fails_startup() {
        let result = PriceFeedDaemon::start(
            DaemonConfig::new(vec![market()], vec![]),
            deps(true, MockPriceFeedServiceClient::new()),
        );
        assert_eq!(
            result.err(),
            Some(DaemonError::MissingQueryConfig("TestExchange".to_string()))
        );
    }

    #[tokio::test]
    async fn prices_flow_into_the_store_and_stop_drains() {
        let mut client = MockPriceFeedServiceClient::new();
        client
            .expect_update_market_prices()
            .returning(|_| Ok(crate::types::UpdateMarketPricesResponse {}));

        let mut config = DaemonConfig::new(vec![market()], vec![query_config()]);
        config.update_interval = Duration::from_millis(10);
        let daemon = PriceFeedDaemon::start(config, deps(true, client)).unwrap();

        let store = daemon.stores().exchange("TestExchange").unwrap();
        for _ in 0..100 {
            if store.get(1).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get(1).map(|p| p.price), Some(5_000_000_000));

        daemon.stop().await;
    }
}
