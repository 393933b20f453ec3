//! sqlcontext-probe binary entry point
//!
//! Runs the connection checkout validator against the configured
//! database until Ctrl-C, or until the validator fails on something
//! other than the database.

use sqlcontext::{DataServices, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Probe entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize metrics
/// 4. Build data services
/// 5. Run the checkout validator until Ctrl-C or a fatal error
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration
    let settings = Settings::load()?;

    // 2. Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sqlcontext={}", settings.logging.level).into());

    if settings.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting sqlcontext probe...");

    // 3. Initialize metrics
    sqlcontext::metrics::init_metrics()?;

    // 4. Build data services
    let services = DataServices::from_settings(&settings)?;
    tracing::info!(
        buffered = settings.database.buffered,
        command_timeout = ?settings.database.command_timeout,
        "Configuration loaded"
    );

    if !settings.checkout.enabled {
        tracing::warn!("Connection checkout disabled; nothing to do");
        return Ok(());
    }

    // 5. Run the validator
    let mut checkout = services.start_checkout();
    tracing::info!(
        interval_secs = settings.checkout.interval_seconds,
        "Connection checkout task spawned"
    );

    // A fatal checkout error ends the probe without waiting for Ctrl-C
    let report = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown requested");
            checkout.stop().await?
        }
        finished = checkout.wait() => finished?,
    };
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        "Connection checkout finished"
    );

    if let Ok(text) = sqlcontext::metrics::gather_text() {
        tracing::debug!(metrics = %text, "Final metrics");
    }

    Ok(())
}
