//! Daemon to node update channel

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::server::http::{PING_PATH, PRICES_PATH};
use crate::server::{ApiResponse, PriceFeedService};
use crate::types::{UpdateMarketPricesRequest, UpdateMarketPricesResponse};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to pricefeed server at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("pricefeed request failed: {0}")]
    Request(String),
    #[error("pricefeed request timed out")]
    Timeout,
    #[error("pricefeed server rejected update (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid response from pricefeed server: {0}")]
    InvalidResponse(String),
}

/// Sends update batches to the authoritative node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeedServiceClient: Send + Sync {
    async fn update_market_prices(
        &self,
        request: UpdateMarketPricesRequest,
    ) -> Result<UpdateMarketPricesResponse, TransportError>;
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(e.to_string())
    }
}

/// HTTP client for the daemon server
#[derive(Debug, Clone)]
pub struct HttpPriceFeedClient {
    client: Client,
    base_url: String,
}

impl HttpPriceFeedClient {
    /// Build the client and ping the server. An unreachable server is a
    /// `Connect` error.
    pub async fn connect(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::Connect {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;

        let url = format!("{}{}", base_url, PING_PATH);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Connect {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(TransportError::Connect {
                url: base_url,
                reason: format!("ping returned status {}", response.status()),
            });
        }

        tracing::info!(url = %base_url, "Connected to pricefeed server");
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl PriceFeedServiceClient for HttpPriceFeedClient {
    async fn update_market_prices(
        &self,
        request: UpdateMarketPricesRequest,
    ) -> Result<UpdateMarketPricesResponse, TransportError> {
        let url = format!("{}{}", self.base_url, PRICES_PATH);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            // error bodies are not always the JSON envelope
            let message = match serde_json::from_slice::<ApiResponse<UpdateMarketPricesResponse>>(&bytes) {
                Ok(ApiResponse { error: Some(error), .. }) => error,
                _ => String::from_utf8_lossy(&bytes).trim().to_string(),
            };
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: ApiResponse<UpdateMarketPricesResponse> = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        body.data
            .ok_or_else(|| TransportError::InvalidResponse("missing response data".to_string()))
    }
}

/// Calls the service directly when daemon and node share a process
#[derive(Clone)]
pub struct LocalPriceFeedClient {
    service: Arc<PriceFeedService>,
}

impl LocalPriceFeedClient {
    pub fn new(service: Arc<PriceFeedService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl PriceFeedServiceClient for LocalPriceFeedClient {
    async fn update_market_prices(
        &self,
        request: UpdateMarketPricesRequest,
    ) -> Result<UpdateMarketPricesResponse, TransportError> {
        self.service
            .update_market_prices(request)
            .map_err(|e| TransportError::Rejected {
                status: 400,
                message: e.to_string(),
            })
    }
}
