//! Upstream Connection
//!
//! Owns the physical feed connection for one subscription key and fans
//! every upstream payload out to the key's subscribers.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──ok──► Open ──remote close / error──► Errored ──backoff──► Connecting
//!      │                                                │
//!      └──────────────fail──────────────────────────────┘
//!
//! any state ──close()──► Closing ──task exit──► Closed
//! ```
//!
//! Reconnects continue while at least one subscriber remains. Fan-out is
//! copy-and-enqueue into each subscriber's bounded [`OutboundQueue`], so a
//! stalled client never delays its peers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedConnector, FeedStream, UpstreamError};
use crate::domain::protocol::ServerMessage;
use crate::domain::session::{OutboundFrame, OutboundQueue, PushOutcome};
use crate::domain::subscription::{SessionId, SubscriptionKey};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Per-connection behavior shared by every upstream.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Consecutive failed attempts before subscribers get a degraded notice.
    pub degraded_after_attempts: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            degraded_after_attempts: 5,
        }
    }
}

impl From<&crate::UpstreamSettings> for UpstreamConfig {
    fn from(settings: &crate::UpstreamSettings) -> Self {
        Self {
            reconnect: ReconnectConfig::from_upstream_settings(settings),
            degraded_after_attempts: settings.degraded_after_attempts,
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// State of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Establishing the physical connection.
    Connecting,
    /// Receiving payloads.
    Open,
    /// Releasing the physical connection.
    Closing,
    /// Terminal.
    Closed,
    /// Failed; waiting to reconnect.
    Errored,
}

impl ConnectionState {
    /// Whether the connection has been asked to close.
    #[must_use]
    pub const fn is_closing_or_closed(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connection, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    /// Subscription key.
    pub key: String,
    /// Current state.
    pub state: ConnectionState,
    /// Current subscriber count.
    pub subscribers: usize,
    /// Payloads received since creation.
    pub messages_received: u64,
    /// Malformed payloads dropped since creation.
    pub protocol_errors: u64,
    /// Consecutive failed attempts (0 while open).
    pub reconnect_attempts: u32,
    /// Most recent connection-level error.
    pub last_error: Option<String>,
    /// When the feed last connected.
    pub last_connected_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Upstream Connection
// =============================================================================

/// One physical upstream feed connection shared by all subscribers of a key.
pub struct UpstreamConnection {
    id: u64,
    key: SubscriptionKey,
    connector: Arc<dyn FeedConnector>,
    config: UpstreamConfig,
    state: watch::Sender<ConnectionState>,
    subscribers: RwLock<HashMap<SessionId, Arc<OutboundQueue>>>,
    last_error: RwLock<Option<String>>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
    opened: AtomicBool,
    messages_received: AtomicU64,
    protocol_errors: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl UpstreamConnection {
    /// Create a connection in the `Connecting` state. Nothing happens until
    /// [`open`](Self::open) is called.
    #[must_use]
    pub fn new(
        id: u64,
        key: SubscriptionKey,
        connector: Arc<dyn FeedConnector>,
        config: UpstreamConfig,
    ) -> Self {
        Self {
            id,
            key,
            connector,
            config,
            state: watch::Sender::new(ConnectionState::Connecting),
            subscribers: RwLock::new(HashMap::new()),
            last_error: RwLock::new(None),
            last_connected_at: RwLock::new(None),
            cancel: CancellationToken::new(),
            opened: AtomicBool::new(false),
            messages_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Unique id of this instance (a key reopened later gets a new id).
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The subscription key this connection serves.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Most recent connection-level error.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Check whether a session is subscribed.
    #[must_use]
    pub fn has_subscriber(&self, session: SessionId) -> bool {
        self.subscribers.read().contains_key(&session)
    }

    /// Payloads received since creation.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Malformed payloads dropped since creation.
    #[must_use]
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Snapshot for health reporting.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            key: self.key.to_string(),
            state: self.state(),
            subscribers: self.subscriber_count(),
            messages_received: self.messages_received(),
            protocol_errors: self.protocol_errors(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_error: self.last_error(),
            last_connected_at: *self.last_connected_at.read(),
        }
    }

    // =========================================================================
    // Subscribers
    // =========================================================================

    /// Add a subscriber. Returns the new subscriber count.
    pub fn add_subscriber(&self, session: SessionId, outbound: Arc<OutboundQueue>) -> usize {
        let mut subscribers = self.subscribers.write();
        subscribers.insert(session, outbound);
        subscribers.len()
    }

    /// Remove a subscriber. Returns the remaining count.
    ///
    /// Removing the last subscriber closes the connection.
    pub fn remove_subscriber(&self, session: SessionId) -> usize {
        let (removed, remaining) = {
            let mut subscribers = self.subscribers.write();
            let removed = subscribers.remove(&session).is_some();
            (removed, subscribers.len())
        };

        if removed && remaining == 0 {
            self.close();
        }
        remaining
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the connection task. Calling it again has no effect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(self: &Arc<Self>) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let connection = Arc::clone(self);
        tokio::spawn(connection.run());
    }

    /// Close the connection and release the physical socket. Idempotent.
    pub fn close(&self) {
        let transitioned = self.state.send_if_modified(|state| {
            if state.is_closing_or_closed() {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });

        if !transitioned {
            return;
        }

        tracing::debug!(key = %self.key, id = self.id, "Closing upstream connection");
        self.cancel.cancel();

        // Without a task there is nothing to wait for.
        if !self.opened.load(Ordering::SeqCst) {
            self.state.send_replace(ConnectionState::Closed);
        }
    }

    /// Wait until the connection reports `Closed`.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    /// Set a non-terminal state unless a close is already in progress.
    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if state.is_closing_or_closed() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    async fn run(self: Arc<Self>) {
        let exchange = self.key.exchange().as_str();
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        let mut degraded = false;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.transition(ConnectionState::Connecting);
            tracing::info!(key = %self.key, "Connecting to upstream feed");

            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.key) => result,
            };

            let failure = match connected {
                Ok(stream) => {
                    self.mark_open();
                    policy.reset();
                    self.reconnect_attempts.store(0, Ordering::Relaxed);
                    if degraded {
                        degraded = false;
                        self.notify_subscribers(&ServerMessage::error(format!(
                            "Upstream feed {} restored",
                            self.key.stream()
                        )));
                    }

                    match self.pump(stream).await {
                        Ok(()) => break,
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            self.record_failure(&failure);

            if self.subscriber_count() == 0 {
                tracing::info!(key = %self.key, "No subscribers left, tearing down upstream");
                break;
            }

            let delay = policy.next_delay();
            let attempt = policy.attempt_count();
            self.reconnect_attempts.store(attempt, Ordering::Relaxed);
            metrics::record_reconnect(exchange);

            if attempt >= self.config.degraded_after_attempts && !degraded {
                degraded = true;
                tracing::warn!(key = %self.key, attempt, "Upstream feed degraded");
                self.notify_subscribers(&ServerMessage::error(format!(
                    "Upstream feed {} degraded: reconnecting after {attempt} failed attempts",
                    self.key.stream()
                )));
            }

            tracing::info!(
                key = %self.key,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to upstream feed"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(ConnectionState::Closed);
        tracing::info!(key = %self.key, id = self.id, "Upstream connection closed");
    }

    /// Read from the feed until cancelled (`Ok`) or a connection-level
    /// failure (`Err`). Dropping the stream on return releases the socket.
    async fn pump(&self, mut stream: FeedStream) -> Result<(), UpstreamError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                item = stream.next() => match item {
                    Some(Ok(payload)) => {
                        self.on_message(&payload);
                    }
                    Some(Err(err)) if !err.is_connection_level() => {
                        self.record_protocol_error(&err);
                    }
                    Some(Err(err)) => return Err(err),
                    None => return Err(UpstreamError::ClosedByRemote),
                }
            }
        }
    }

    fn mark_open(&self) {
        self.transition(ConnectionState::Open);
        *self.last_connected_at.write() = Some(Utc::now());
        *self.last_error.write() = None;
        tracing::info!(key = %self.key, "Upstream feed connected");
    }

    fn record_failure(&self, err: &UpstreamError) {
        self.transition(ConnectionState::Errored);
        *self.last_error.write() = Some(err.to_string());
        metrics::record_upstream_error(self.key.exchange().as_str(), err.kind());
        tracing::warn!(key = %self.key, error = %err, "Upstream connection error");
    }

    fn record_protocol_error(&self, err: &UpstreamError) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_protocol_error(self.key.exchange().as_str());
        tracing::warn!(key = %self.key, error = %err, "Dropping malformed upstream payload");
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Deliver one upstream payload to every subscriber.
    ///
    /// Malformed payloads are logged and dropped. Returns the number of
    /// subscribers the frame was offered to.
    pub fn on_message(&self, payload: &str) -> usize {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_upstream_message(self.key.exchange().as_str());

        let frame = match encode_market_frame(&self.key, payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.record_protocol_error(&err);
                return 0;
            }
        };

        self.fan_out(&frame)
    }

    fn notify_subscribers(&self, message: &ServerMessage) {
        match message.to_frame() {
            Ok(frame) => {
                self.fan_out(&frame);
            }
            Err(err) => {
                tracing::error!(key = %self.key, error = %err, "Failed to encode notice");
            }
        }
    }

    fn fan_out(&self, frame: &OutboundFrame) -> usize {
        let subscribers = self.subscribers.read();
        let mut dropped = 0_u64;

        for (session, queue) in subscribers.iter() {
            let outcome = queue.push(frame.clone());
            if outcome.is_overflow() {
                dropped += 1;
                tracing::trace!(session_id = %session, key = %self.key, "Outbound queue full");
            } else if outcome == PushOutcome::Closed {
                tracing::trace!(session_id = %session, key = %self.key, "Outbound queue closed");
            }
        }

        if dropped > 0 {
            metrics::record_frames_dropped(dropped);
        }
        subscribers.len()
    }
}

/// Validate an upstream payload and wrap it in the client envelope.
fn encode_market_frame(key: &SubscriptionKey, payload: &str) -> Result<OutboundFrame, UpstreamError> {
    let data: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
    ServerMessage::market_data(key.exchange(), data)
        .to_frame()
        .map_err(|e| UpstreamError::Protocol(e.to_string()))
}

// =============================================================================
// Tests
// =============================================================================
