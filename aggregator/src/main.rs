mod alerts;
mod config;
mod errors;
mod metrics;
mod model;
mod rest;
mod store;
mod stream;

use axum::{routing::get, Router};
use clap::Parser;
use config::Config;
use errors::{ApiError, Error};
use std::sync::Arc;
use store::TelemetryStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config.validate()?;

    info!("Starting telemetry aggregator");
    info!("HTTP server: {}", config.http_addr);
    info!(
        "History capacity: {}, alert log: {}, liveness window: {}s",
        config.history_capacity, config.alert_capacity, config.liveness_window_secs
    );
    if config.uses_default_secret() {
        warn!("Using the default gateway secret; set GATEWAY_SECRET_KEY");
    }

    metrics::init_metrics()?;

    let store = Arc::new(TelemetryStore::new(config.store_config()));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store, &config.gateway_secret));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .map_err(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            Error::Io(e)
        })?;

    info!("HTTP server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

async fn metrics_handler() -> Result<String, ApiError> {
    Ok(metrics::gather_metrics()?)
}
