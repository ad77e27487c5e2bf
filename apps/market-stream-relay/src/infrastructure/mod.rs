//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the servers,
//! configuration, and observability around them.

/// Shared upstream connections and their registry.
pub mod upstream;

/// Exchange WebSocket client adapters.
pub mod exchange;

/// Client-facing WebSocket server.
pub mod server;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
