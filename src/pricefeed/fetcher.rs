//! Per-exchange price fetcher
//!
//! Polls one exchange on a fixed interval and pushes every query result onto
//! the exchange's bounded queue. Dropping the fetcher closes the queue.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::exchange::ExchangeQueryDetails;
use super::market_config::ExchangeMarketConfig;
use super::query_handler::{ExchangeQueryHandler, QueryError, QueryOutcome};
use crate::types::{ExchangeId, ExchangeQueryConfig, Exponent, MarketId, ParamError};

/// Default capacity of each exchange's response queue
pub const DEFAULT_QUEUE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetcherError {
    #[error(transparent)]
    InvalidQueryConfig(#[from] ParamError),
    #[error("query config is for exchange {config} but query details are for {details}")]
    ExchangeMismatch { config: ExchangeId, details: ExchangeId },
}

/// One query result delivered to the encoder
#[derive(Debug, Clone)]
pub struct PriceFetcherResponse {
    pub exchange_id: ExchangeId,
    pub result: Result<QueryOutcome, QueryError>,
}

pub struct PriceFetcher {
    query_config: ExchangeQueryConfig,
    details: ExchangeQueryDetails,
    market_config: Arc<ExchangeMarketConfig>,
    market_exponents: Arc<HashMap<MarketId, Exponent>>,
    handler: Arc<dyn ExchangeQueryHandler>,
    tx: mpsc::Sender<PriceFetcherResponse>,
    market_ids: Vec<MarketId>,
    next_index: usize,
}

impl PriceFetcher {
    pub fn new(
        query_config: ExchangeQueryConfig,
        details: ExchangeQueryDetails,
        market_config: Arc<ExchangeMarketConfig>,
        market_exponents: Arc<HashMap<MarketId, Exponent>>,
        handler: Arc<dyn ExchangeQueryHandler>,
        tx: mpsc::Sender<PriceFetcherResponse>,
    ) -> Result<Self, FetcherError> {
        query_config.validate()?;
        if query_config.exchange_id != details.exchange {
            return Err(FetcherError::ExchangeMismatch {
                config: query_config.exchange_id,
                details: details.exchange,
            });
        }

        let market_ids = market_config.market_ids();
        Ok(Self {
            query_config,
            details,
            market_config,
            market_exponents,
            handler,
            tx,
            market_ids,
            next_index: 0,
        })
    }

    pub fn exchange_id(&self) -> &str {
        &self.query_config.exchange_id
    }

    /// Market batches for the next tick. Multi-market exchanges get a single
    /// batch with every market. Otherwise up to `max_queries` single-market
    /// batches, continuing round-robin from where the previous tick stopped.
    pub fn next_batches(&mut self) -> Vec<Vec<MarketId>> {
        if self.market_ids.is_empty() {
            return Vec::new();
        }

        if self.details.is_multi_market {
            return vec![self.market_ids.clone()];
        }

        let count = (self.query_config.max_queries as usize).min(self.market_ids.len());
        let batches = (0..count)
            .map(|offset| {
                let index = (self.next_index + offset) % self.market_ids.len();
                vec![self.market_ids[index]]
            })
            .collect();
        self.next_index = (self.next_index + count) % self.market_ids.len();
        batches
    }

    /// Run one polling round. Returns `false` once the encoder side is gone.
    pub async fn run_task_loop(&mut self) -> bool {
        let batches = self.next_batches();
        if batches.is_empty() {
            return true;
        }

        let timeout_ms = u64::from(self.query_config.timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);
        let handler = &self.handler;
        let details = &self.details;
        let market_config = &self.market_config;
        let market_exponents = &self.market_exponents;
        let queries = batches.iter().map(|market_ids| async move {
            let query = handler.query(details, market_config, market_ids, market_exponents);
            match tokio::time::timeout(timeout, query).await {
                Ok(result) => result,
                Err(_) => Err(QueryError::Timeout(timeout_ms)),
            }
        });
        let results = join_all(queries).await;

        for result in results {
            let response = PriceFetcherResponse {
                exchange_id: self.query_config.exchange_id.clone(),
                result,
            };
            if self.tx.send(response).await.is_err() {
                debug!(exchange = %self.exchange_id(), "price queue closed by encoder");
                return false;
            }
        }
        true
    }

    /// Poll every `interval_ms` until `stop` flips to true or its sender is
    /// dropped. Consumes the fetcher so the queue closes on return.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(u64::from(self.query_config.interval_ms)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            exchange = %self.exchange_id(),
            markets = self.market_ids.len(),
            interval_ms = self.query_config.interval_ms,
            "Starting price fetcher"
        );

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.run_task_loop().await {
                        break;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(exchange = %self.exchange_id(), "Price fetcher stopped");
    }
}
