//! Daemon-side price ingestion
//!
//! Fetches prices from exchanges, encodes them into per-exchange stores and
//! ships snapshots to the node.

pub mod client;
pub mod encoder;
pub mod exchange;
pub mod fetcher;
pub mod market_config;
pub mod query_handler;
pub mod sources;
pub mod store;
pub mod transport;
pub mod updater;

pub use client::{DaemonConfig, DaemonDeps, DaemonError, PriceFeedDaemon};
pub use encoder::{EncodeError, PriceEncoder};
pub use exchange::{ExchangeQueryDetails, ExchangeRegistry, PriceFunction, PriceFunctionError};
pub use fetcher::{PriceFetcher, PriceFetcherResponse};
pub use market_config::{build_exchange_market_configs, ExchangeMarketConfig, MarketConfigError};
pub use query_handler::{
    ExchangeQueryHandler, HttpQueryHandler, QueryError, QueryOutcome, ReqwestRequestHandler,
    RequestHandler,
};
pub use sources::ResponseFormat;
pub use store::{ExchangeMarketPrices, ExchangeToMarketPrices};
pub use transport::{
    HttpPriceFeedClient, LocalPriceFeedClient, PriceFeedServiceClient, TransportError,
};
pub use updater::{PriceUpdater, UpdaterError, PRICE_UPDATER_SERVICE};
