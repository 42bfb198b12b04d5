//! Process wiring
//!
//! Startup order: server bound and serving, daemon server reachable, daemon
//! loops, health supervisor. Any failure before the last step stops what was
//! already started.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::health::{supervise, HealthMonitor, SupervisorError};
use crate::pricefeed::{
    DaemonDeps, HttpPriceFeedClient, HttpQueryHandler, PriceFeedDaemon, ReqwestRequestHandler,
};
use crate::reporter::{PriceGuard, ReportSink, SpotPriceReporter};
use crate::server::http::{bind, create_router, serve};
use crate::server::{MarketToExchangePrices, PriceFeedService, PRICEFEED_SERVER_SERVICE};
use crate::time::{SystemClock, TimeProvider};

pub struct App {
    stop_tx: watch::Sender<bool>,
    server: JoinHandle<std::io::Result<()>>,
    supervisor: JoinHandle<Result<(), SupervisorError>>,
    daemon: PriceFeedDaemon,
    service: Arc<PriceFeedService>,
    guard: Arc<PriceGuard>,
    health: Arc<HealthMonitor>,
    local_addr: SocketAddr,
}

impl App {
    pub async fn start(config: &AppConfig) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let clock: Arc<dyn TimeProvider> = Arc::new(SystemClock);
        let health = Arc::new(HealthMonitor::new(
            Duration::from_secs(config.health.grace_period_secs),
            Arc::clone(&clock),
        ));

        let server_reporter = health
            .register_service(PRICEFEED_SERVER_SERVICE, config.max_unhealthy())
            .context("Failed to register server health")?;
        let service = Arc::new(PriceFeedService::new(
            Arc::new(MarketToExchangePrices::new(Duration::from_secs(
                config.server.max_price_age_secs,
            ))),
            Arc::new(config.markets.clone()),
            server_reporter,
            Arc::clone(&clock),
        ));
        let guard = Arc::new(PriceGuard::new(
            config.price_guard_options(),
            Arc::clone(&clock),
        ));
        if !guard.is_enabled() {
            warn!("Price guard disabled, every median will be reported");
        }

        let listener = bind(&config.server.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.listen_addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let router = create_router(Arc::clone(&service), Arc::clone(&health));
        let server = tokio::spawn(serve(listener, router, stop_rx.clone()));

        let daemon = match Self::start_daemon(config, &health, &clock).await {
            Ok(daemon) => daemon,
            Err(e) => {
                let _ = stop_tx.send(true);
                if let Err(join) = server.await {
                    warn!(error = %join, "Server task ended abnormally");
                }
                return Err(e);
            }
        };

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&health),
            Duration::from_secs(config.health.poll_interval_secs),
            config.failure_policy(),
            stop_rx,
        ));

        info!(addr = %local_addr, config = %config.digest(), "✅ Pricefeed started");

        Ok(Self {
            stop_tx,
            server,
            supervisor,
            daemon,
            service,
            guard,
            health,
            local_addr,
        })
    }

    async fn start_daemon(
        config: &AppConfig,
        health: &Arc<HealthMonitor>,
        clock: &Arc<dyn TimeProvider>,
    ) -> Result<PriceFeedDaemon> {
        let client = HttpPriceFeedClient::connect(
            &config.daemon.server_url,
            Duration::from_millis(config.daemon.connect_timeout_ms),
            Duration::from_millis(config.daemon.request_timeout_ms),
        )
        .await
        .context("Daemon server is unreachable")?;

        let registry = config
            .exchange_registry()
            .context("Failed to build exchange registry")?;
        let slowest = config
            .exchanges
            .iter()
            .map(|e| u64::from(e.timeout_ms))
            .max()
            .unwrap_or(config.daemon.request_timeout_ms);
        let requests = Arc::new(
            ReqwestRequestHandler::with_timeout(Duration::from_millis(slowest))
                .context("Failed to build exchange HTTP client")?,
        );

        PriceFeedDaemon::start(
            config.daemon_config(),
            DaemonDeps {
                registry,
                query_handler: Arc::new(HttpQueryHandler::new(Arc::clone(clock), requests)),
                client: Arc::new(client),
                health: Arc::clone(health),
                clock: Arc::clone(clock),
            },
        )
        .context("Failed to start pricefeed daemon")
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn service(&self) -> &Arc<PriceFeedService> {
        &self.service
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn guard(&self) -> &Arc<PriceGuard> {
        &self.guard
    }

    /// Reporter over this node's medians and guard, submitting to `sink`
    pub fn reporter(&self, sink: Arc<dyn ReportSink>) -> SpotPriceReporter {
        SpotPriceReporter::new(Arc::clone(&self.service), Arc::clone(&self.guard), sink)
    }

    /// Resolves when the supervisor exits, with its shutdown reason if any
    pub async fn supervisor_exit(&mut self) -> Result<()> {
        match (&mut self.supervisor).await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e).context("Health supervisor panicked")),
        }
    }

    /// Signal every task and wait for them to finish
    pub async fn shutdown(self) -> Result<()> {
        info!("🛑 Shutting down pricefeed");
        let _ = self.stop_tx.send(true);
        self.daemon.stop().await;

        // A supervisor already awaited through `supervisor_exit` must not be polled again
        if !self.supervisor.is_finished() {
            if let Err(e) = self.supervisor.await {
                warn!(error = %e, "Health supervisor ended abnormally");
            }
        }
        match self.server.await {
            Ok(result) => result.context("Pricefeed server failed")?,
            Err(e) => error!(error = %e, "Server task ended abnormally"),
        }
        Ok(())
    }
}
