//! Pricefeed node
//!
//! Runs the daemon server, the exchange pricefeed daemon and the health
//! supervisor in one process.

use anyhow::Result;
use pricefeed::app::App;
use pricefeed::config::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PRICEFEED_LOG_JSON").is_ok_and(|v| v == "1" || v == "true");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing();

    info!("🚀 Starting pricefeed v{}", env!("CARGO_PKG_VERSION"));
    info!(config = %config, "Configuration loaded");

    let mut app = App::start(&config).await?;

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
            Ok(())
        }
        result = app.supervisor_exit() => result,
    };

    app.shutdown().await?;

    if let Err(e) = &outcome {
        error!(error = %e, "❌ Pricefeed stopped on health failure");
    }
    outcome
}
