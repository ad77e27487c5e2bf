//! Client Wire Protocol
//!
//! JSON messages exchanged with downstream clients.
//!
//! # Client -> Server
//!
//! ```json
//! {"exchange": "binance", "action": "subscribe", "pair": ["btcusdt", "ethusdt"]}
//! ```
//!
//! # Server -> Client
//!
//! ```json
//! {"message": "binance", "data": {"e": "trade", "s": "BTCUSDT"}}
//! {"message": "Some pairs were rejected", "rejected": ["btc/usdt"]}
//! ```

use serde::Serialize;
use serde_json::Value;

use super::session::OutboundFrame;
use super::subscription::Exchange;

// =============================================================================
// Requests
// =============================================================================

/// Requested subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start receiving the listed pairs.
    Subscribe,
    /// Stop receiving the listed pairs.
    Unsubscribe,
}

impl Action {
    /// Parse an action name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "subscribe" => Some(Self::Subscribe),
            "unsubscribe" => Some(Self::Unsubscribe),
            _ => None,
        }
    }

    /// Get the action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Errors returned to a client for a control message.
///
/// None of these close the client connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Malformed JSON or missing/invalid fields.
    #[error("Invalid request format: {reason}")]
    InvalidRequest {
        /// What was wrong with the request.
        reason: String,
        /// Pairs rejected individually, if the batch got that far.
        rejected: Vec<String>,
    },

    /// Exchange identifier not in the supported set.
    #[error("Unsupported exchange: {0}")]
    UnsupportedExchange(String),

    /// The session is already closing.
    #[error("Session is closed")]
    SessionClosed,
}

impl RequestError {
    /// Create an `InvalidRequest` error without rejected pairs.
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
            rejected: Vec::new(),
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::UnsupportedExchange(_) => "unsupported_exchange",
            Self::SessionClosed => "session_closed",
        }
    }

    /// Build the error frame sent to the client.
    #[must_use]
    pub fn to_message(&self) -> ServerMessage {
        match self {
            Self::InvalidRequest { rejected, .. } => {
                ServerMessage::rejected(self.to_string(), rejected.clone())
            }
            Self::UnsupportedExchange(_) | Self::SessionClosed => {
                ServerMessage::error(self.to_string())
            }
        }
    }
}

// =============================================================================
// Server Messages
// =============================================================================

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    /// Exchange name for market data, or a human readable description.
    pub message: String,
    /// Upstream payload, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Pairs rejected from a batch request.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<String>,
}

impl ServerMessage {
    /// Market data fan-out frame.
    #[must_use]
    pub fn market_data(exchange: Exchange, data: Value) -> Self {
        Self {
            message: exchange.as_str().to_string(),
            data: Some(data),
            rejected: Vec::new(),
        }
    }

    /// Error or notice frame.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
            rejected: Vec::new(),
        }
    }

    /// Error frame listing rejected pairs.
    #[must_use]
    pub fn rejected(message: impl Into<String>, rejected: Vec<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
            rejected,
        }
    }

    /// Serialize into a frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_frame(&self) -> Result<OutboundFrame, serde_json::Error> {
        serde_json::to_string(self).map(OutboundFrame::from)
    }
}

// =============================================================================
// Tests
// =============================================================================
