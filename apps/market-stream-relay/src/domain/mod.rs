//! Domain Layer - Core relay types.
//!
//! Subscription keys, the bounded outbound queue and the client wire
//! protocol. Nothing here performs I/O.

/// Client wire protocol messages and request errors.
pub mod protocol;

/// Outbound queue and session lifecycle state.
pub mod session;

/// Subscription keys, exchanges and session identity.
pub mod subscription;
