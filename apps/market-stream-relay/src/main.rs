//! Market Stream Relay Binary
//!
//! Starts the client WebSocket relay and its health endpoint.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-stream-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Optional
//! - `RELAY_PORT`: Client WebSocket port (default: 9800)
//! - `RELAY_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `RELAY_STREAM_PATH`: Upgrade path (default: /market-stream)
//! - `RELAY_EXCHANGES`: Comma-separated exchanges (default: binance,binance_us)
//! - `RELAY_STREAM_TYPE`: Stream suffix per pair (default: trade)
//! - `BINANCE_STREAM_URL`: Binance raw stream base URL
//! - `BINANCE_US_STREAM_URL`: Binance US raw stream base URL
//! - `RELAY_CONNECT_TIMEOUT_SECS`: Upstream connect timeout (default: 10)
//! - `RELAY_RECONNECT_DELAY_INITIAL_MS`: First reconnect delay (default: 1000)
//! - `RELAY_RECONNECT_DELAY_MAX_SECS`: Reconnect delay cap (default: 30)
//! - `RELAY_RECONNECT_DELAY_MULTIPLIER`: Backoff multiplier (default: 2.0)
//! - `RELAY_RECONNECT_JITTER`: Jitter fraction (default: 0.2)
//! - `RELAY_DEGRADED_AFTER_ATTEMPTS`: Failures before a degraded notice (default: 5)
//! - `RELAY_HEARTBEAT_INTERVAL_SECS`: Upstream ping interval (default: 30)
//! - `RELAY_HEARTBEAT_TIMEOUT_SECS`: Upstream silence limit (default: 60)
//! - `RELAY_OUTBOUND_QUEUE_CAPACITY`: Per-client queue size (default: 1024)
//! - `RELAY_OVERFLOW_POLICY`: drop_oldest | drop_newest (default: drop_oldest)
//! - `RELAY_SEND_TIMEOUT_SECS`: Per-write client timeout (default: 5)
//! - `RELAY_SHUTDOWN_TIMEOUT_SECS`: Upstream close bound on shutdown (default: 10)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-stream-relay)
//! - `RUST_LOG`: Log filter (default: info)

use std::sync::Arc;

use anyhow::{Context, anyhow};
use market_stream_relay::application::services::{Router, SessionConfig};
use market_stream_relay::infrastructure::exchange::{WebSocketConnector, WebSocketConnectorConfig};
use market_stream_relay::infrastructure::health::{HealthServer, HealthServerState};
use market_stream_relay::infrastructure::server::{RelayServer, RelayState};
use market_stream_relay::infrastructure::telemetry;
use market_stream_relay::infrastructure::upstream::{UpstreamConfig, UpstreamRegistry};
use market_stream_relay::{RelayConfig, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Market Stream Relay");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream connector and shared connection registry
    let connector = WebSocketConnector::new(WebSocketConnectorConfig::from_upstream_settings(
        &config.upstream,
    ));
    let registry = Arc::new(UpstreamRegistry::new(
        Arc::new(connector),
        UpstreamConfig::from(&config.upstream),
    ));

    // Request routing and relay state
    let router = Arc::new(Router::new(
        config.exchanges.clone(),
        config.stream_type.clone(),
    ));
    let relay_state = Arc::new(RelayState::new(
        Arc::clone(&registry),
        router,
        SessionConfig::from(&config.session),
        config.server.stream_path.clone(),
        shutdown_token.clone(),
    ));

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&relay_state),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn relay server
    let relay_server = RelayServer::new(
        config.server.port,
        Arc::clone(&relay_state),
        shutdown_token.clone(),
    );
    let relay_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        if let Err(e) = relay_server.run().await {
            tracing::error!(error = %e, "Relay server error");
            relay_shutdown.cancel();
        }
    });

    tracing::info!("Market stream relay ready");

    await_shutdown(shutdown_token.clone()).await;

    tracing::info!(
        timeout_secs = config.shutdown_timeout.as_secs(),
        "Graceful shutdown started"
    );

    // Upstreams close first; listeners and sessions stop after.
    let report = registry.shutdown(config.shutdown_timeout).await;
    tracing::info!(
        closed = report.closed,
        abandoned = report.abandoned,
        "Upstream connections closed"
    );
    shutdown_token.cancel();

    tracing::info!("Market stream relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    let exchanges: Vec<&str> = config.exchanges.iter().map(|e| e.as_str()).collect();
    tracing::info!(
        port = config.server.port,
        health_port = config.server.health_port,
        stream_path = %config.server.stream_path,
        exchanges = ?exchanges,
        stream_type = config.stream_type.as_str(),
        overflow_policy = config.session.overflow_policy.as_str(),
        queue_capacity = config.session.outbound_queue_capacity,
        "Configuration loaded"
    );
    tracing::debug!(
        binance_url = %config.upstream.binance_url,
        binance_us_url = %config.upstream.binance_us_url,
        "Upstream endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT) or an internal cancel.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => {
            tracing::warn!("Relay server exited, initiating shutdown");
        }
    }
}
