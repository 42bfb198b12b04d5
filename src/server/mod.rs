//! Node-side endpoint: the authoritative median cache and the daemon server

pub mod cache;
pub mod http;
pub mod service;

pub use cache::{MarketToExchangePrices, MedianWithSources, SourcePrice};
pub use http::{create_router, serve, ApiResponse, HealthResponse};
pub use service::{
    validate_update_request, MedianQueryError, MedianValue, PriceFeedService,
    UpdateValidationError, PRICEFEED_SERVER_SERVICE,
};
