//! Configuration management for the pricefeed
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

use crate::health::FailurePolicy;
use crate::pricefeed::exchange::RegistryError;
use crate::pricefeed::{
    build_exchange_market_configs, DaemonConfig, ExchangeQueryDetails, ExchangeRegistry,
    MarketConfigError, ResponseFormat,
};
use crate::reporter::PriceGuardOptions;
use crate::types::{ExchangeId, ExchangeQueryConfig, MarketParam, ParamError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Market(#[from] MarketConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("exchange {0} is configured more than once")]
    DuplicateExchange(ExchangeId),
    #[error("exchange {0} is referenced by a market but has no settings")]
    MissingExchange(ExchangeId),
    #[error("exchange {0} has an empty url")]
    EmptyUrl(ExchangeId),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("price guard threshold must be a non-negative number, got {0}")]
    InvalidThreshold(f64),
    #[error("{field} must be at most {max} seconds")]
    TooLarge { field: &'static str, max: u64 },
}

/// Upper bound for every configured age or window, ten years
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub daemon: DaemonSettings,
    pub server: ServerSettings,
    pub health: HealthSettings,
    pub price_guard: PriceGuardSettings,
    #[serde(default)]
    pub markets: Vec<MarketParam>,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    /// Interval between snapshots sent to the server in milliseconds
    pub update_interval_ms: u64,
    /// Base URL of the daemon server
    pub server_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Local price staleness for adjust-by medians
    pub max_price_age_secs: u64,
    /// Per-exchange response queue capacity
    pub queue_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub listen_addr: String,
    /// Cache price staleness
    pub max_price_age_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthSettings {
    /// Startup window during which no service is flagged
    pub grace_period_secs: u64,
    pub poll_interval_secs: u64,
    /// Unhealthy budget per service
    pub max_unhealthy_secs: u64,
    /// Shut down when a service fails its health check
    pub panic_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceGuardSettings {
    pub enabled: bool,
    /// Maximum relative change (0.5 = 50%)
    pub threshold: f64,
    /// Last price expiry, 0 disables expiry
    pub max_age_secs: u64,
    pub update_on_block: bool,
    /// Overrides keyed by query id hex
    #[serde(default)]
    pub query_thresholds: HashMap<String, f64>,
}

/// One polled exchange
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeSettings {
    pub exchange_id: ExchangeId,
    pub interval_ms: u32,
    pub timeout_ms: u32,
    pub max_queries: u32,
    /// Request URL, `$` is replaced by the ticker(s)
    pub url: String,
    #[serde(default = "default_multi_market")]
    pub is_multi_market: bool,
    #[serde(default)]
    pub format: ResponseFormat,
}

fn default_multi_market() -> bool {
    true
}

impl ExchangeSettings {
    pub fn query_config(&self) -> ExchangeQueryConfig {
        ExchangeQueryConfig {
            exchange_id: self.exchange_id.clone(),
            interval_ms: self.interval_ms,
            timeout_ms: self.timeout_ms,
            max_queries: self.max_queries,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()
            .context("Failed to set configuration defaults")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (PRICEFEED__*)
            .add_source(Environment::with_prefix("PRICEFEED").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Builder preloaded with every default
    pub fn defaults() -> std::result::Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        Config::builder()
            // Daemon defaults
            .set_default("daemon.update_interval_ms", 3000)?
            .set_default("daemon.server_url", "http://127.0.0.1:7171")?
            .set_default("daemon.connect_timeout_ms", 5000)?
            .set_default("daemon.request_timeout_ms", 5000)?
            .set_default("daemon.max_price_age_secs", 30)?
            .set_default("daemon.queue_buffer", 256)?
            // Server defaults
            .set_default("server.listen_addr", "127.0.0.1:7171")?
            .set_default("server.max_price_age_secs", 30)?
            // Health defaults
            .set_default("health.grace_period_secs", 60)?
            .set_default("health.poll_interval_secs", 5)?
            .set_default("health.max_unhealthy_secs", 300)?
            .set_default("health.panic_on_failure", true)?
            // Price guard defaults
            .set_default("price_guard.enabled", true)?
            .set_default("price_guard.threshold", 0.5)?
            .set_default("price_guard.max_age_secs", 1800)?
            .set_default("price_guard.update_on_block", false)
    }

    /// Check every market, exchange and interval before anything starts
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.daemon.update_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("daemon.update_interval_ms"));
        }
        if self.daemon.queue_buffer == 0 {
            return Err(ConfigError::ZeroValue("daemon.queue_buffer"));
        }
        if self.health.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroValue("health.poll_interval_secs"));
        }
        if self.price_guard.threshold.is_nan() || self.price_guard.threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.price_guard.threshold));
        }
        for (field, secs) in [
            ("daemon.max_price_age_secs", self.daemon.max_price_age_secs),
            ("server.max_price_age_secs", self.server.max_price_age_secs),
            ("health.grace_period_secs", self.health.grace_period_secs),
            ("health.poll_interval_secs", self.health.poll_interval_secs),
            ("health.max_unhealthy_secs", self.health.max_unhealthy_secs),
            ("price_guard.max_age_secs", self.price_guard.max_age_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::TooLarge {
                    field,
                    max: MAX_DURATION_SECS,
                });
            }
        }

        let mut exchange_ids = HashSet::new();
        for exchange in &self.exchanges {
            exchange.query_config().validate()?;
            if exchange.url.is_empty() {
                return Err(ConfigError::EmptyUrl(exchange.exchange_id.clone()));
            }
            if !exchange_ids.insert(exchange.exchange_id.as_str()) {
                return Err(ConfigError::DuplicateExchange(exchange.exchange_id.clone()));
            }
        }

        let market_configs = build_exchange_market_configs(&self.markets)?;
        let mut referenced: Vec<&ExchangeId> = market_configs.keys().collect();
        referenced.sort();
        if let Some(missing) = referenced
            .into_iter()
            .find(|id| !exchange_ids.contains(id.as_str()))
        {
            return Err(ConfigError::MissingExchange(missing.clone()));
        }

        Ok(())
    }

    pub fn daemon_config(&self) -> DaemonConfig {
        let mut config = DaemonConfig::new(
            self.markets.clone(),
            self.exchanges.iter().map(ExchangeSettings::query_config).collect(),
        );
        config.update_interval = Duration::from_millis(self.daemon.update_interval_ms);
        config.max_price_age = Duration::from_secs(self.daemon.max_price_age_secs);
        config.queue_buffer = self.daemon.queue_buffer;
        config.max_unhealthy = self.max_unhealthy();
        config
    }

    /// Registry of every configured exchange using its built-in format
    pub fn exchange_registry(&self) -> std::result::Result<ExchangeRegistry, ConfigError> {
        let mut registry = ExchangeRegistry::new();
        for exchange in &self.exchanges {
            registry.register(ExchangeQueryDetails {
                exchange: exchange.exchange_id.clone(),
                url: exchange.url.clone(),
                price_function: exchange.format.price_function(),
                is_multi_market: exchange.is_multi_market,
            })?;
        }
        Ok(registry)
    }

    pub fn price_guard_options(&self) -> PriceGuardOptions {
        PriceGuardOptions {
            enabled: self.price_guard.enabled,
            threshold: self.price_guard.threshold,
            max_age: Duration::from_secs(self.price_guard.max_age_secs),
            update_on_block: self.price_guard.update_on_block,
            query_thresholds: self.price_guard.query_thresholds.clone(),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::from_panic_on_failure(self.health.panic_on_failure)
    }

    pub fn max_unhealthy(&self) -> Duration {
        Duration::from_secs(self.health.max_unhealthy_secs)
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "listen={} server_url={} markets={} exchanges={} update_ms={} guard={}({:.2})",
            self.server.listen_addr,
            self.daemon.server_url,
            self.markets.len(),
            self.exchanges.len(),
            self.daemon.update_interval_ms,
            self.price_guard.enabled,
            self.price_guard.threshold
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
