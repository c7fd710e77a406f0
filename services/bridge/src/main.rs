//! Image bridge service: MQTT (mutual TLS) to PostgreSQL.
//!
//! Configuration is loaded from `config/bridge`, `/etc/image-bridge/bridge`,
//! `BRIDGE__*` environment variables and the flat `MQTT_*`/`PG_*` variables.
//! See `config.rs` for all options.

use anyhow::{Context, Result};
use image_bridge::config::{Config, LoggingConfig};
use image_bridge::Bridge;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.logging);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        broker = %config.mqtt.broker,
        topic = %config.mqtt.topic,
        "Starting image bridge"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let bridge = match Bridge::start(config).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e).context("Failed to start image bridge");
        }
    };

    let stats = bridge.run(shutdown_signal()).await?;

    info!(
        received = stats.received,
        stored = stats.stored,
        rejected = stats.rejected,
        dropped = stats.dropped,
        "Clean shutdown complete"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
