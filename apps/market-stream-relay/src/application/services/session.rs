//! Client Session
//!
//! One connected downstream client: its subscription set, its bounded
//! outbound queue, and the hooks the router uses to change subscriptions.
//!
//! The session only holds keys. Connections live in the
//! [`UpstreamRegistry`], which counts this session as a subscriber of every
//! key in [`ClientSession::subscriptions`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::router::{RequestOutcome, Router};
use crate::domain::protocol::{RequestError, ServerMessage};
use crate::domain::session::{OutboundFrame, OutboundQueue, OverflowPolicy, PushOutcome, SessionState};
use crate::domain::subscription::{SessionId, SubscriptionKey};
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::{RegistryError, UpstreamRegistry};

/// Per-session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity.
    pub outbound_capacity: usize,
    /// What to drop when the queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single write to the client.
    pub send_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&crate::SessionSettings> for SessionConfig {
    fn from(settings: &crate::SessionSettings) -> Self {
        Self {
            outbound_capacity: settings.outbound_queue_capacity,
            overflow_policy: settings.overflow_policy,
            send_timeout: settings.send_timeout,
        }
    }
}

/// A connected client.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    state: SessionState,
    subscriptions: HashSet<SubscriptionKey>,
    outbound: Arc<OutboundQueue>,
    registry: Arc<UpstreamRegistry>,
    router: Arc<Router>,
}

impl ClientSession {
    /// Create an active session with an empty subscription set.
    #[must_use]
    pub fn new(
        id: SessionId,
        config: &SessionConfig,
        registry: Arc<UpstreamRegistry>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Active,
            subscriptions: HashSet::new(),
            outbound: Arc::new(OutboundQueue::new(
                config.outbound_capacity,
                config.overflow_policy,
            )),
            registry,
            router,
        }
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session still accepts requests.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// The outbound queue drained by the client writer.
    #[must_use]
    pub fn outbound(&self) -> Arc<OutboundQueue> {
        Arc::clone(&self.outbound)
    }

    /// Keys currently held.
    #[must_use]
    pub const fn subscriptions(&self) -> &HashSet<SubscriptionKey> {
        &self.subscriptions
    }

    /// Check whether a key is held.
    #[must_use]
    pub fn holds(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains(key)
    }

    /// Queue a frame for the client. Never blocks.
    pub fn enqueue(&self, frame: OutboundFrame) -> PushOutcome {
        let outcome = self.outbound.push(frame);
        if outcome.is_overflow() {
            metrics::record_frames_dropped(1);
        }
        outcome
    }

    /// Serialize and queue a message.
    pub fn send(&self, message: &ServerMessage) -> PushOutcome {
        match message.to_frame() {
            Ok(frame) => self.enqueue(frame),
            Err(err) => {
                tracing::error!(session_id = %self.id, error = %err, "Failed to encode frame");
                PushOutcome::Closed
            }
        }
    }

    /// Apply a raw control message.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] if the request is rejected as a whole;
    /// the subscription set is then unchanged.
    pub fn subscribe(&mut self, raw: &str) -> Result<RequestOutcome, RequestError> {
        let router = Arc::clone(&self.router);
        router.handle(self, raw)
    }

    /// Subscribe to one key. Returns `false` if it was already held.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is shutting down.
    pub fn acquire(&mut self, key: &SubscriptionKey) -> Result<bool, RegistryError> {
        if self.subscriptions.contains(key) {
            return Ok(false);
        }
        self.registry
            .subscribe(key, self.id, Arc::clone(&self.outbound))?;
        self.subscriptions.insert(key.clone());
        Ok(true)
    }

    /// Unsubscribe from one key. Returns `false` if it was not held.
    pub fn release(&mut self, key: &SubscriptionKey) -> bool {
        if !self.subscriptions.remove(key) {
            return false;
        }
        self.registry.unsubscribe(key, self.id);
        true
    }

    /// Release every subscription and discard queued frames. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.state = SessionState::Closing;

        let released = self.registry.release_all(self.id);
        self.subscriptions.clear();
        let discarded = self.outbound.close();

        self.state = SessionState::Closed;
        tracing::debug!(
            session_id = %self.id,
            released = released.len(),
            discarded,
            "Session closed"
        );
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}
