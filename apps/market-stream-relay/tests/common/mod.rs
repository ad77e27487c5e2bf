//! Shared fixtures for relay integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use market_stream_relay::{
    ClientSession, Exchange, FeedConnector, FeedStream, OutboundQueue, Router, SessionConfig,
    SessionId, StreamType, SubscriptionKey, UpstreamConfig, UpstreamError, UpstreamRegistry,
};
use market_stream_relay::infrastructure::upstream::ReconnectConfig;

type FeedSender = mpsc::UnboundedSender<Result<String, UpstreamError>>;

/// In-memory upstream: every connect opens a channel the test can push into.
#[derive(Default)]
pub struct ChannelConnector {
    feeds: Mutex<HashMap<SubscriptionKey, Vec<FeedSender>>>,
    connects: Mutex<HashMap<SubscriptionKey, usize>>,
    fail_next: AtomicUsize,
}

impl ChannelConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Number of successful connects for `key`.
    pub fn connects(&self, key: &SubscriptionKey) -> usize {
        self.connects.lock().get(key).copied().unwrap_or(0)
    }

    /// Total successful connects across every key.
    pub fn total_connects(&self) -> usize {
        self.connects.lock().values().sum()
    }

    /// Whether any feed for `key` is still held by the relay.
    pub fn is_live(&self, key: &SubscriptionKey) -> bool {
        self.feeds
            .lock()
            .get(key)
            .is_some_and(|senders| senders.iter().any(|tx| !tx.is_closed()))
    }

    /// Push a raw payload into every live feed for `key`.
    ///
    /// Returns the number of feeds that accepted it.
    pub fn push(&self, key: &SubscriptionKey, payload: &str) -> usize {
        let mut feeds = self.feeds.lock();
        let Some(senders) = feeds.get_mut(key) else {
            return 0;
        };
        senders.retain(|tx| tx.send(Ok(payload.to_string())).is_ok());
        senders.len()
    }

    /// End every feed for `key` as if the exchange closed the socket.
    pub fn close_remote(&self, key: &SubscriptionKey) {
        self.feeds.lock().remove(key);
    }
}

#[async_trait]
impl FeedConnector for ChannelConnector {
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedStream, UpstreamError> {
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(UpstreamError::Connect("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().entry(key.clone()).or_default().push(tx);
        *self.connects.lock().entry(key.clone()).or_default() += 1;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Upstream config with millisecond backoff.
pub fn fast_upstream_config() -> UpstreamConfig {
    UpstreamConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter_factor: 0.0,
        },
        degraded_after_attempts: 3,
    }
}

pub fn registry(connector: &Arc<ChannelConnector>) -> Arc<UpstreamRegistry> {
    let connector: Arc<dyn FeedConnector> = Arc::clone(connector) as Arc<dyn FeedConnector>;
    Arc::new(UpstreamRegistry::new(connector, fast_upstream_config()))
}

pub fn router() -> Arc<Router> {
    Arc::new(Router::new(Exchange::all().to_vec(), StreamType::default()))
}

pub fn session(id: u64, registry: &Arc<UpstreamRegistry>, config: &SessionConfig) -> ClientSession {
    ClientSession::new(SessionId::new(id), config, Arc::clone(registry), router())
}

pub fn key(pair: &str) -> SubscriptionKey {
    SubscriptionKey::new(Exchange::Binance, pair, &StreamType::default())
}

pub fn subscribe_request(pairs: &[&str]) -> String {
    serde_json::json!({"exchange": "binance", "action": "subscribe", "pair": pairs}).to_string()
}

pub fn unsubscribe_request(pairs: &[&str]) -> String {
    serde_json::json!({"exchange": "binance", "action": "unsubscribe", "pair": pairs}).to_string()
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Wait for the next frame on `queue` and parse it.
pub async fn next_frame(queue: &OutboundQueue) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(2), queue.pop())
        .await
        .expect("timed out waiting for a frame")
        .expect("queue closed");
    serde_json::from_str(frame.as_str()).unwrap()
}
