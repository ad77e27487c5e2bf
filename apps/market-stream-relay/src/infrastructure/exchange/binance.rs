//! Binance Raw Stream Client
//!
//! Opens one WebSocket per subscription key against the exchange's raw
//! stream endpoint and forwards every text frame as a feed item.
//!
//! # Stream URL
//!
//! - Binance: `wss://stream.binance.com:9443/ws/<pair>@<type>`
//! - Binance US: `wss://stream.binance.us:9443/ws/<pair>@<type>`
//!
//! # Protocol
//!
//! Payloads are JSON objects, one per text frame. The server pings every few
//! minutes and disconnects clients that do not pong.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use crate::application::ports::{FeedConnector, FeedStream, UpstreamError};
use crate::domain::subscription::{Exchange, SubscriptionKey};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type FeedSender = mpsc::Sender<Result<String, UpstreamError>>;

/// Payloads buffered between the socket task and the connection task.
const FEED_CHANNEL_CAPACITY: usize = 1024;

/// Bound on sending our Close frame to a stalled exchange socket.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the exchange WebSocket connector.
#[derive(Debug, Clone)]
pub struct WebSocketConnectorConfig {
    /// Raw stream base URL per exchange.
    pub endpoints: HashMap<Exchange, String>,
    /// Upper bound on connect plus handshake.
    pub connect_timeout: Duration,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl Default for WebSocketConnectorConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::from([
                (Exchange::Binance, "wss://stream.binance.com:9443/ws".to_string()),
                (Exchange::BinanceUs, "wss://stream.binance.us:9443/ws".to_string()),
            ]),
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl WebSocketConnectorConfig {
    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub fn from_upstream_settings(settings: &crate::UpstreamSettings) -> Self {
        Self {
            endpoints: HashMap::from([
                (Exchange::Binance, settings.binance_url.clone()),
                (Exchange::BinanceUs, settings.binance_us_url.clone()),
            ]),
            connect_timeout: settings.connect_timeout,
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
        }
    }

    /// Point one exchange at a different base URL.
    #[must_use]
    pub fn with_endpoint(mut self, exchange: Exchange, url: impl Into<String>) -> Self {
        self.endpoints.insert(exchange, url.into());
        self
    }
}

// =============================================================================
// Connector
// =============================================================================

/// [`FeedConnector`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    config: WebSocketConnectorConfig,
}

impl WebSocketConnector {
    /// Create a new connector.
    #[must_use]
    pub const fn new(config: WebSocketConnectorConfig) -> Self {
        Self { config }
    }

    /// Full stream URL for `key`.
    ///
    /// # Errors
    ///
    /// Returns `Connect` if no endpoint is configured for the key's exchange.
    pub fn stream_url(&self, key: &SubscriptionKey) -> Result<String, UpstreamError> {
        let base = self.config.endpoints.get(&key.exchange()).ok_or_else(|| {
            UpstreamError::Connect(format!("no endpoint configured for {}", key.exchange()))
        })?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), key.stream()))
    }
}

#[async_trait]
impl FeedConnector for WebSocketConnector {
    async fn connect(&self, key: &SubscriptionKey) -> Result<FeedStream, UpstreamError> {
        let url = self.stream_url(key)?;
        tracing::debug!(key = %key, url = %url, "Opening exchange stream");

        let (socket, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| {
            UpstreamError::Connect(format!(
                "timed out after {}s",
                self.config.connect_timeout.as_secs()
            ))
        })?
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        tokio::spawn(pump_socket(
            socket,
            tx,
            self.config.heartbeat.clone(),
            key.to_string(),
        ));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Forward frames from the socket until it fails or the feed stream is
/// dropped, in which case a Close frame is sent.
async fn pump_socket(socket: Socket, tx: FeedSender, heartbeat: HeartbeatConfig, key: String) {
    let (mut write, mut read) = socket.split();
    let mut monitor = HeartbeatMonitor::new(heartbeat, Instant::now());

    let heartbeat_enabled = monitor.interval().is_some();
    if !heartbeat_enabled {
        tracing::debug!(key = %key, "Heartbeat disabled");
    }
    // Never polled when disabled; the period only has to be non-zero.
    let period = monitor.interval().unwrap_or(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = tx.closed() => {
                tracing::debug!(key = %key, "Feed released, closing socket");
                if !send_close(&mut write, CLOSE_TIMEOUT).await {
                    tracing::debug!(key = %key, "Close frame not sent, dropping socket");
                }
                break;
            }
            _ = ticker.tick(), if heartbeat_enabled => {
                match monitor.on_tick(Instant::now()) {
                    HeartbeatAction::Idle => {}
                    HeartbeatAction::SendPing => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            let _ = tx.send(Err(UpstreamError::Transport(e.to_string()))).await;
                            break;
                        }
                    }
                    HeartbeatAction::TimedOut => {
                        tracing::warn!(key = %key, "Heartbeat timeout");
                        let _ = tx.send(Err(UpstreamError::HeartbeatTimeout)).await;
                        break;
                    }
                }
            }
            frame = read.next() => {
                monitor.record_activity(Instant::now());
                let item = match frame {
                    Some(Ok(Message::Text(text))) => Ok(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => String::from_utf8(data.to_vec())
                        .map_err(|_| UpstreamError::Protocol("binary frame is not UTF-8".to_string())),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = tx.send(Err(UpstreamError::Transport(e.to_string()))).await;
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(key = %key, frame = ?frame, "Exchange sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(UpstreamError::Transport(e.to_string()))).await;
                        break;
                    }
                    None => break,
                };

                if tx.send(item).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Send a Close frame, giving up after `limit`.
///
/// Returns whether the frame was written.
async fn send_close<S>(write: &mut S, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
{
    matches!(
        tokio::time::timeout(limit, write.send(Message::Close(None))).await,
        Ok(Ok(()))
    )
}

#[cfg(test)]
mod tests {
    use std::pin::pin;

    use tokio::net::TcpListener;

    use super::*;
    use crate::domain::subscription::StreamType;

    fn key(exchange: Exchange, pair: &str) -> SubscriptionKey {
        SubscriptionKey::new(exchange, pair, &StreamType::default())
    }

    #[test]
    fn stream_url_per_exchange() {
        let connector = WebSocketConnector::new(WebSocketConnectorConfig::default());

        assert_eq!(
            connector.stream_url(&key(Exchange::Binance, "btcusdt")).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@trade"
        );
        assert_eq!(
            connector.stream_url(&key(Exchange::BinanceUs, "ethusdt")).unwrap(),
            "wss://stream.binance.us:9443/ws/ethusdt@trade"
        );
    }

    #[test]
    fn stream_url_ignores_trailing_slash() {
        let config = WebSocketConnectorConfig::default()
            .with_endpoint(Exchange::Binance, "ws://127.0.0.1:9000/ws/");
        let connector = WebSocketConnector::new(config);

        assert_eq!(
            connector.stream_url(&key(Exchange::Binance, "btcusdt")).unwrap(),
            "ws://127.0.0.1:9000/ws/btcusdt@trade"
        );
    }

    #[test]
    fn stream_url_keeps_stream_type_case() {
        let connector = WebSocketConnector::new(WebSocketConnectorConfig::default());
        let agg_trade = StreamType::new("aggTrade").unwrap();
        let key = SubscriptionKey::new(Exchange::Binance, "btcusdt", &agg_trade);

        assert_eq!(
            connector.stream_url(&key).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@aggTrade"
        );
    }

    #[test]
    fn missing_endpoint_is_connect_error() {
        let config = WebSocketConnectorConfig {
            endpoints: HashMap::new(),
            ..WebSocketConnectorConfig::default()
        };
        let connector = WebSocketConnector::new(config);

        assert!(matches!(
            connector.stream_url(&key(Exchange::Binance, "btcusdt")),
            Err(UpstreamError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_connect_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = WebSocketConnectorConfig::default()
            .with_endpoint(Exchange::Binance, format!("ws://{addr}/ws"));
        let connector = WebSocketConnector::new(config);

        let result = connector.connect(&key(Exchange::Binance, "btcusdt")).await;
        assert!(matches!(result, Err(UpstreamError::Connect(_))));
    }

    #[tokio::test]
    async fn forwards_text_frames_until_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"e":"trade","t":1}"#.to_string().into())).await.unwrap();
            ws.send(Message::Text(r#"{"e":"trade","t":2}"#.to_string().into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let config = WebSocketConnectorConfig::default()
            .with_endpoint(Exchange::Binance, format!("ws://{addr}/ws"));
        let connector = WebSocketConnector::new(config);
        let mut feed = connector
            .connect(&key(Exchange::Binance, "btcusdt"))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        assert_eq!(first, Some(Ok(r#"{"e":"trade","t":1}"#.to_string())));
        assert_eq!(second, Some(Ok(r#"{"e":"trade","t":2}"#.to_string())));

        let end = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        assert_eq!(end, None);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_feed_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            // Next frame from the client should be its Close.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Close(_))) | None => return true,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => return false,
                }
            }
        });

        let config = WebSocketConnectorConfig::default()
            .with_endpoint(Exchange::Binance, format!("ws://{addr}/ws"));
        let connector = WebSocketConnector::new(config);
        let feed = connector
            .connect(&key(Exchange::Binance, "btcusdt"))
            .await
            .unwrap();
        drop(feed);

        let saw_close = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("server should observe the close")
            .unwrap();
        assert!(saw_close);
    }

    #[tokio::test]
    async fn zero_heartbeat_still_forwards_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            ws.send(Message::Text(r#"{"t":1}"#.to_string().into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let config = WebSocketConnectorConfig {
            heartbeat: HeartbeatConfig::new(Duration::ZERO, Duration::ZERO),
            ..WebSocketConnectorConfig::default()
        }
        .with_endpoint(Exchange::Binance, format!("ws://{addr}/ws"));
        let connector = WebSocketConnector::new(config);
        let mut feed = connector
            .connect(&key(Exchange::Binance, "btcusdt"))
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        assert_eq!(first, Some(Ok(r#"{"t":1}"#.to_string())));
        let end = tokio::time::timeout(Duration::from_secs(2), feed.next()).await.unwrap();
        assert_eq!(end, None);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn close_on_stalled_socket_gives_up() {
        let stalled = futures_util::sink::unfold((), |(), _message: Message| {
            std::future::pending::<Result<(), std::io::Error>>()
        });
        let mut stalled = pin!(stalled);

        let started = tokio::time::Instant::now();
        let sent = send_close(&mut stalled, Duration::from_millis(50)).await;

        assert!(!sent);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn close_on_open_sink_is_sent() {
        let (mut tx, mut rx) = futures::channel::mpsc::unbounded::<Message>();

        assert!(send_close(&mut tx, Duration::from_millis(50)).await);
        assert_eq!(rx.next().await, Some(Message::Close(None)));
    }
}
