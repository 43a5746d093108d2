mod config;
mod errors;
mod parser;
mod relay;
mod transport;
mod uplink;

use clap::Parser;
use config::{Config, TransportKind};
use parser::SampleParser;
use relay::Relay;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::{LinkState, TransportHandler};
use uplink::HttpUplink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    config.validate()?;

    info!("Starting gateway {}", config.gateway_id);
    info!("Aggregator: {}", config.cloud_url);
    info!("Transport: {} ({})", config.transport.as_str(), config.device_name());
    if config.transport == TransportKind::Ble {
        info!(
            "BLE service: {:?}, characteristic: {:?}",
            config.ble_service_uuid, config.ble_char_uuid
        );
    }
    if config.uses_default_secret() {
        warn!("Using the default gateway secret; set GATEWAY_SECRET_KEY");
    }

    let parser = Arc::new(SampleParser::new(
        config.history_capacity,
        config.inference_policy,
    ));
    let uplink = Arc::new(HttpUplink::new(&config.cloud_url, &config.gateway_secret)?);
    let relay = Arc::new(Relay::new(config.relay_config(), uplink));

    // Offline at startup is fine; the liveness cycle keeps retrying.
    relay.announce().await;

    let link = transport::build_link(&config)?;

    // Bounded channel between the transport and the relay
    let (tx, rx) = mpsc::channel(config.sample_channel_capacity);
    let handler = TransportHandler::start(link, parser.clone(), tx, config.reconnect_backoff());

    let (stop_tx, stop_rx) = watch::channel(false);

    let forwarder_handle = tokio::spawn(relay::run_forwarder(relay.clone(), rx, stop_rx.clone()));
    let liveness_handle = tokio::spawn(relay::run_liveness(
        relay.clone(),
        config.liveness_interval(),
        stop_rx.clone(),
    ));
    let link_log_handle = tokio::spawn(log_link_changes(handler.state_changes(), stop_rx));

    tokio::select! {
        _ = handler.join() => {
            error!("Transport terminated");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down (device link {:?})", handler.state());
    handler.stop();
    handler.join().await;
    stop_tx.send_replace(true);

    for (name, handle) in [
        ("forwarder", forwarder_handle),
        ("liveness", liveness_handle),
        ("link monitor", link_log_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }

    let last = parser.snapshot();
    info!(
        "Last reading: HR {} bpm, SpO2 {}%, Temp {:.1}°C, {}",
        last.fc, last.spo2, last.temp, last.state
    );
    relay.log_status();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn log_link_changes(mut changes: watch::Receiver<LinkState>, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *changes.borrow_and_update();
                info!("Device link: {:?}", state);
            }
        }
    }
}
