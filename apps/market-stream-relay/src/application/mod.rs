//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the port through which upstream feeds are opened and
//! the services that drive client sessions.

/// Port interfaces for external systems (upstream feeds).
pub mod ports;

/// Client session and request routing services.
pub mod services;
