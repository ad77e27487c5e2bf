//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: payloads received, protocol errors, connection errors, reconnects
//! - **Clients**: frames sent and dropped, active sessions, control requests
//! - **Latency**: time to write one frame to a client
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before [`init_metrics`] is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling it again returns the existing handle.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Upstream
    describe_counter!(
        "market_relay_upstream_messages_total",
        "Total payloads received from exchange feeds"
    );
    describe_counter!(
        "market_relay_upstream_protocol_errors_total",
        "Total malformed upstream payloads dropped"
    );
    describe_counter!(
        "market_relay_upstream_errors_total",
        "Total upstream connection-level errors by kind"
    );
    describe_counter!(
        "market_relay_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_gauge!(
        "market_relay_upstream_connections",
        "Number of live upstream connections"
    );

    // Clients
    describe_counter!(
        "market_relay_frames_sent_total",
        "Total frames written to clients"
    );
    describe_counter!(
        "market_relay_frames_dropped_total",
        "Total frames dropped by full client queues"
    );
    describe_gauge!(
        "market_relay_client_sessions",
        "Number of connected client sessions"
    );
    describe_counter!(
        "market_relay_client_requests_total",
        "Total client control requests by action and outcome"
    );

    // Latency
    describe_histogram!(
        "market_relay_client_send_seconds",
        "Time to write one frame to a client"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a payload received from an exchange feed.
pub fn record_upstream_message(exchange: &'static str) {
    counter!("market_relay_upstream_messages_total", "exchange" => exchange).increment(1);
}

/// Record a malformed upstream payload.
pub fn record_protocol_error(exchange: &'static str) {
    counter!("market_relay_upstream_protocol_errors_total", "exchange" => exchange).increment(1);
}

/// Record an upstream connection-level error.
pub fn record_upstream_error(exchange: &'static str, kind: &'static str) {
    counter!(
        "market_relay_upstream_errors_total",
        "exchange" => exchange,
        "kind" => kind
    )
    .increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect(exchange: &'static str) {
    counter!("market_relay_reconnects_total", "exchange" => exchange).increment(1);
}

/// Update the live upstream connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_connections(count: usize) {
    gauge!("market_relay_upstream_connections").set(count as f64);
}

/// Record a frame written to a client.
pub fn record_frame_sent(duration: Duration) {
    counter!("market_relay_frames_sent_total").increment(1);
    histogram!("market_relay_client_send_seconds").record(duration.as_secs_f64());
}

/// Record frames dropped by full client queues.
pub fn record_frames_dropped(count: u64) {
    counter!("market_relay_frames_dropped_total").increment(count);
}

/// Update the connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_client_sessions(count: usize) {
    gauge!("market_relay_client_sessions").set(count as f64);
}

/// Record a client control request.
pub fn record_client_request(action: &'static str, outcome: &'static str) {
    counter!(
        "market_relay_client_requests_total",
        "action" => action,
        "outcome" => outcome
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
