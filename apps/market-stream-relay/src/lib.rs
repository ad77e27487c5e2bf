#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Market Stream Relay - Upstream Feed Multiplexer
//!
//! A WebSocket relay that lets many downstream clients subscribe to
//! exchange market data while holding at most one upstream connection per
//! distinct stream.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: Pure types with no I/O
//!   - `subscription`: exchanges, pairs, subscription keys
//!   - `session`: bounded outbound queue and overflow policy
//!   - `protocol`: client request errors and server frames
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: the `FeedConnector` interface to upstream feeds
//!   - `services`: request routing and client sessions
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: reference-counted connection registry with reconnect
//!   - `exchange`: Binance raw stream WebSocket client
//!   - `server`: client WebSocket endpoint
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Binance btcusdt@trade ──► UpstreamConnection ──┬──► queue ──► Client 1
//!                                                └──► queue ──► Client 2
//! Binance ethusdt@trade ──► UpstreamConnection ──────► queue ──► Client 2
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core relay types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::protocol::{Action, RequestError, ServerMessage};
pub use domain::session::{OutboundFrame, OutboundQueue, OverflowPolicy, PushOutcome, SessionState};
pub use domain::subscription::{Exchange, SessionId, StreamType, SubscriptionKey};

// Ports and services
pub use application::ports::{FeedConnector, FeedStream, UpstreamError};
pub use application::services::{ClientSession, RequestOutcome, Router, SessionConfig};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, RelayConfig, ServerSettings, SessionSettings, UpstreamSettings,
};

// Upstream manager
pub use infrastructure::upstream::{
    ConnectionState, RegistryError, ShutdownReport, UpstreamConfig, UpstreamConnection,
    UpstreamRegistry,
};

// Exchange adapter
pub use infrastructure::exchange::{WebSocketConnector, WebSocketConnectorConfig};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::server::{RelayServer, RelayServerError, RelayState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
