//! Upstream Connection Manager
//!
//! Shared, reference-counted upstream feed connections:
//!
//! - **Registry**: one live connection per subscription key
//! - **Connection**: lifecycle, fan-out, and reconnect loop for one key
//! - **Reconnect**: exponential backoff with jitter

pub mod connection;
pub mod reconnect;
pub mod registry;

pub use connection::{ConnectionSnapshot, ConnectionState, UpstreamConfig, UpstreamConnection};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use registry::{RegistryError, ShutdownReport, SubscriptionHandle, UpstreamRegistry};
