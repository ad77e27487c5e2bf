//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedConnector`: opens a push stream for one upstream subscription key

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::subscription::SubscriptionKey;

/// Items produced by an upstream feed.
///
/// The stream ending means the remote side closed the connection. Dropping
/// the stream releases the physical connection.
pub type FeedStream = BoxStream<'static, Result<String, UpstreamError>>;

/// Errors raised by upstream feeds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Could not establish the connection.
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The transport failed after connecting.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The remote closed the connection.
    #[error("upstream closed the connection")]
    ClosedByRemote,

    /// No pong or traffic within the heartbeat timeout.
    #[error("upstream heartbeat timed out")]
    HeartbeatTimeout,

    /// A payload could not be interpreted. Never fatal to the connection.
    #[error("malformed upstream payload: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Whether the error ends the physical connection.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Transport(_) => "transport",
            Self::ClosedByRemote => "closed_by_remote",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// Opens upstream push streams keyed by subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedConnector: Send + Sync + 'static {
    /// Connect to the upstream stream for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedStream, UpstreamError>;
}
