//! Daemon server HTTP transport
//!
//! JSON endpoints the daemon's updater and the reporter talk to.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use super::service::{MedianQueryError, MedianValue, PriceFeedService};
use crate::health::{HealthMonitor, ServiceHealthSnapshot};
use crate::types::{UpdateMarketPricesRequest, UpdateMarketPricesResponse};

pub const PRICES_PATH: &str = "/v1/pricefeed/prices";
pub const PING_PATH: &str = "/v1/ping";

/// Response envelope shared by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub services: Vec<ServiceHealthSnapshot>,
}

#[derive(Clone)]
struct ServerState {
    service: Arc<PriceFeedService>,
    health: Arc<HealthMonitor>,
}

type Reply<T> = (StatusCode, Json<ApiResponse<T>>);

/// Create the router with all endpoints
pub fn create_router(service: Arc<PriceFeedService>, health: Arc<HealthMonitor>) -> Router {
    Router::new()
        .route(PRICES_PATH, post(update_market_prices))
        .route("/v1/median", get(get_all_medians))
        .route("/v1/median/:query_data", get(get_median))
        .route("/v1/health", get(get_health))
        .route(PING_PATH, get(ping))
        .with_state(ServerState { service, health })
        .layer(TraceLayer::new_for_http())
}

/// POST /v1/pricefeed/prices - Apply a daemon update batch
async fn update_market_prices(
    State(state): State<ServerState>,
    Json(request): Json<UpdateMarketPricesRequest>,
) -> Reply<UpdateMarketPricesResponse> {
    match state.service.update_market_prices(request) {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => {
            tracing::warn!(error = %e, "Rejected market price update");
            (StatusCode::BAD_REQUEST, Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// GET /v1/median - Every market with a valid median
async fn get_all_medians(State(state): State<ServerState>) -> Reply<Vec<MedianValue>> {
    let now = state.service.now();
    (
        StatusCode::OK,
        Json(ApiResponse::success(state.service.all_median_values(now))),
    )
}

/// GET /v1/median/:query_data - Median for one query
async fn get_median(
    State(state): State<ServerState>,
    Path(query_data): Path<String>,
) -> Reply<MedianValue> {
    let now = state.service.now();
    match state.service.median_value(&query_data, now) {
        Ok(value) => (StatusCode::OK, Json(ApiResponse::success(value))),
        Err(e @ MedianQueryError::UnknownQueryData(_)) => {
            (StatusCode::NOT_FOUND, Json(ApiResponse::error(e.to_string())))
        }
        Err(e @ MedianQueryError::NoValidMedian { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// GET /v1/health - Registered services and their status
async fn get_health(State(state): State<ServerState>) -> Reply<HealthResponse> {
    let healthy = state.health.failed_services().is_empty();
    let response = HealthResponse {
        healthy,
        services: state.health.snapshot(),
    };
    (StatusCode::OK, Json(ApiResponse::success(response)))
}

/// GET /v1/ping - Reachability check
async fn ping() -> Reply<&'static str> {
    (StatusCode::OK, Json(ApiResponse::success("pong")))
}

/// Bind the listener before any loop that depends on it starts
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve until `stop` flips to true or its sender is dropped
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut stop: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "🌐 Pricefeed server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("Pricefeed server stopped");
    Ok(())
}
