//! Upstream Registry
//!
//! Maps each [`SubscriptionKey`] to at most one live [`UpstreamConnection`]
//! and tracks which sessions hold it.
//!
//! Every mutation runs under one lock, so two sessions subscribing to the
//! same key concurrently always share the same connection, and an entry is
//! removed in the same critical section that drops its last subscriber.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;

use super::connection::{ConnectionSnapshot, UpstreamConfig, UpstreamConnection};
use crate::application::ports::FeedConnector;
use crate::domain::session::OutboundQueue;
use crate::domain::subscription::{SessionId, SubscriptionKey};
use crate::infrastructure::metrics;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The relay is shutting down and no longer opens upstreams.
    #[error("relay is shutting down")]
    ShuttingDown,
}

/// Result of a successful subscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    /// The key subscribed to.
    pub key: SubscriptionKey,
    /// The shared connection serving the key.
    pub connection: Arc<UpstreamConnection>,
    /// Whether this call created the connection.
    pub created: bool,
}

/// Outcome of [`UpstreamRegistry::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections that reached `Closed` within the timeout.
    pub closed: usize,
    /// Connections still closing when the timeout elapsed.
    pub abandoned: usize,
}

/// Shared table of live upstream connections.
pub struct UpstreamRegistry {
    connector: Arc<dyn FeedConnector>,
    config: UpstreamConfig,
    connections: Mutex<HashMap<SubscriptionKey, Arc<UpstreamConnection>>>,
    accepting: AtomicBool,
    next_id: AtomicU64,
}

impl std::fmt::Debug for UpstreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamRegistry")
            .field("connections", &self.len())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

impl UpstreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(connector: Arc<dyn FeedConnector>, config: UpstreamConfig) -> Self {
        Self {
            connector,
            config,
            connections: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add `session` as a subscriber of `key`, opening the upstream if no
    /// live connection exists. Subscribing twice is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ShuttingDown` once [`shutdown`](Self::shutdown) has started.
    pub fn subscribe(
        &self,
        key: &SubscriptionKey,
        session: SessionId,
        outbound: Arc<OutboundQueue>,
    ) -> Result<SubscriptionHandle, RegistryError> {
        let (handle, total) = {
            let mut connections = self.connections.lock();
            if !self.is_accepting() {
                return Err(RegistryError::ShuttingDown);
            }

            // An entry whose connection already began closing is replaced.
            let live = connections
                .get(key)
                .filter(|conn| !conn.state().is_closing_or_closed())
                .cloned();

            let (connection, created) = match live {
                Some(conn) => (conn, false),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let conn = Arc::new(UpstreamConnection::new(
                        id,
                        key.clone(),
                        Arc::clone(&self.connector),
                        self.config.clone(),
                    ));
                    connections.insert(key.clone(), Arc::clone(&conn));
                    (conn, true)
                }
            };

            let subscribers = connection.add_subscriber(session, outbound);
            if created {
                connection.open();
            }

            tracing::debug!(
                session_id = %session,
                key = %key,
                subscribers,
                created,
                "Subscribed"
            );

            (
                SubscriptionHandle {
                    key: key.clone(),
                    connection,
                    created,
                },
                connections.len(),
            )
        };

        metrics::set_upstream_connections(total);
        Ok(handle)
    }

    /// Remove `session` from `key`. Closes and removes the connection when
    /// its last subscriber leaves.
    ///
    /// Returns `false` if the session was not subscribed.
    pub fn unsubscribe(&self, key: &SubscriptionKey, session: SessionId) -> bool {
        let (removed, total) = {
            let mut connections = self.connections.lock();
            let Some(connection) = connections.get(key) else {
                return false;
            };
            if !connection.has_subscriber(session) {
                return false;
            }

            if connection.remove_subscriber(session) == 0 {
                connections.remove(key);
                tracing::debug!(session_id = %session, key = %key, "Last subscriber left");
            }
            (true, connections.len())
        };

        metrics::set_upstream_connections(total);
        removed
    }

    /// Remove `session` from every key it holds.
    ///
    /// Returns the keys released.
    pub fn release_all(&self, session: SessionId) -> Vec<SubscriptionKey> {
        let (released, total) = {
            let mut connections = self.connections.lock();
            let mut released = Vec::new();

            connections.retain(|key, connection| {
                if !connection.has_subscriber(session) {
                    return true;
                }
                released.push(key.clone());
                connection.remove_subscriber(session) > 0
            });
            (released, connections.len())
        };

        if !released.is_empty() {
            tracing::debug!(session_id = %session, released = released.len(), "Released subscriptions");
        }
        metrics::set_upstream_connections(total);
        released
    }

    /// Stop accepting subscriptions, close every connection, and wait up to
    /// `timeout` for them to finish.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let drained: Vec<Arc<UpstreamConnection>> = {
            let mut connections = self.connections.lock();
            self.accepting.store(false, Ordering::SeqCst);
            connections.drain().map(|(_, conn)| conn).collect()
        };
        metrics::set_upstream_connections(0);

        if drained.is_empty() {
            return ShutdownReport::default();
        }

        tracing::info!(connections = drained.len(), "Closing upstream connections");
        for connection in &drained {
            connection.close();
        }

        let waits = drained.iter().map(|conn| conn.wait_closed());
        if tokio::time::timeout(timeout, join_all(waits)).await.is_ok() {
            return ShutdownReport {
                closed: drained.len(),
                abandoned: 0,
            };
        }

        let closed = drained
            .iter()
            .filter(|conn| conn.state() == super::connection::ConnectionState::Closed)
            .count();
        let abandoned = drained.len() - closed;
        tracing::warn!(closed, abandoned, "Shutdown timeout elapsed");
        ShutdownReport { closed, abandoned }
    }

    /// Live connection for `key`, if any.
    #[must_use]
    pub fn connection(&self, key: &SubscriptionKey) -> Option<Arc<UpstreamConnection>> {
        self.connections.lock().get(key).cloned()
    }

    /// Subscriber count for `key` (0 if no live connection).
    #[must_use]
    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.connections
            .lock()
            .get(key)
            .map_or(0, |conn| conn.subscriber_count())
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Check whether there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether subscriptions are still accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Snapshot of every live connection, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshots: Vec<ConnectionSnapshot> = self
            .connections
            .lock()
            .values()
            .map(|conn| conn.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}
