//! Client WebSocket Server
//!
//! Accepts client WebSocket connections on the stream path and runs one
//! [`ClientSession`] per connection.
//!
//! # Endpoints
//!
//! - `GET /market-stream` (configurable) - WebSocket upgrade; plain HTTP gets the landing page
//! - `GET /` - HTML landing page
//! - anything else - `404` plain text naming the correct URL
//!
//! # Per-connection tasks
//!
//! The reader handles control messages on the connection task. A writer
//! task drains the session's outbound queue; each write is bounded by the
//! send timeout and a client that misses it is disconnected.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, Request, State};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{ClientSession, Router, SessionConfig};
use crate::domain::protocol::ServerMessage;
use crate::domain::session::OutboundQueue;
use crate::domain::subscription::SessionId;
use crate::infrastructure::metrics;
use crate::infrastructure::upstream::UpstreamRegistry;

// =============================================================================
// Relay State
// =============================================================================

/// State shared by every client connection.
#[derive(Debug)]
pub struct RelayState {
    registry: Arc<UpstreamRegistry>,
    router: Arc<Router>,
    session_config: SessionConfig,
    stream_path: String,
    active_sessions: AtomicUsize,
    shutdown: CancellationToken,
}

impl RelayState {
    /// Create relay state. Cancelling `shutdown` ends every session.
    #[must_use]
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        router: Arc<Router>,
        session_config: SessionConfig,
        stream_path: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            router,
            session_config,
            stream_path: stream_path.into(),
            active_sessions: AtomicUsize::new(0),
            shutdown,
        }
    }

    /// The upstream registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<UpstreamRegistry> {
        &self.registry
    }

    /// Path clients upgrade on.
    #[must_use]
    pub fn stream_path(&self) -> &str {
        &self.stream_path
    }

    /// Number of connected clients.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled() || !self.registry.is_accepting()
    }
}

// =============================================================================
// Relay Server
// =============================================================================

/// Client-facing WebSocket server.
pub struct RelayServer {
    port: u16,
    state: Arc<RelayState>,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Create a new relay server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<RelayState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `RelayServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), RelayServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(
            port = self.port,
            path = %self.state.stream_path(),
            "Relay server listening"
        );

        serve(listener, self.state, self.cancel).await?;
        tracing::info!("Relay server stopped");
        Ok(())
    }
}

/// Serve the relay on an already-bound listener until `cancel` fires.
///
/// # Errors
///
/// Returns `ServerFailed` if the HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    cancel: CancellationToken,
) -> Result<(), RelayServerError> {
    axum::serve(listener, app(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| RelayServerError::ServerFailed(e.to_string()))
}

/// Build the HTTP router.
pub fn app(state: Arc<RelayState>) -> axum::Router {
    let stream_path = state.stream_path.clone();
    let mut router = axum::Router::new().route(&stream_path, get(upgrade_handler));
    if stream_path != "/" {
        router = router.route("/", get(landing_handler));
    }
    router.fallback(not_found_handler).with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn upgrade_handler(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let Ok(ws) = WebSocketUpgrade::from_request_parts(&mut parts, &state).await else {
        return landing_page(&parts.headers, &state).into_response();
    };

    if state.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Relay is shutting down").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn landing_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    landing_page(&headers, &state)
}

async fn not_found_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::CONNECTION, "close"),
        ],
        format!(
            "WebSocket path invalid. Use ws://{}{}",
            host(&headers),
            state.stream_path
        ),
    )
}

fn landing_page(headers: &HeaderMap, state: &RelayState) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Market Stream Relay</title></head>\n\
         <body>\n<h1>Market stream relay is running</h1>\n\
         <p>Connect a WebSocket client to <code>ws://{}{}</code>.</p>\n</body>\n</html>\n",
        host(headers),
        state.stream_path
    ))
}

/// Host to advertise back to the client.
///
/// Only hostname, IP literal and port characters are echoed; anything else
/// falls back to `localhost` so the header never reaches the page as markup.
fn host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty() && h.chars().all(is_host_char))
        .unwrap_or("localhost")
}

const fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '[' | ']')
}

// =============================================================================
// Connection Loop
// =============================================================================

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let session_id = SessionId::generate();
    let mut session = ClientSession::new(
        session_id,
        &state.session_config,
        Arc::clone(&state.registry),
        Arc::clone(&state.router),
    );

    let connected = state.active_sessions.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_client_sessions(connected);
    tracing::info!(session_id = %session_id, "Client connected");

    let (sink, mut stream) = socket.split();
    let send_timeout = state.session_config.send_timeout;
    let mut writer = tokio::spawn(write_frames(sink, session.outbound(), send_timeout, session_id));
    let mut writer_done = false;

    loop {
        tokio::select! {
            () = state.shutdown.cancelled() => break,
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => handle_request(&mut session, text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => handle_request(&mut session, text),
                    Err(_) => {
                        session.send(&ServerMessage::error("Invalid JSON format"));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Client read failed");
                    break;
                }
            }
        }
    }

    // Closing the queue ends the writer after it sends a Close frame.
    session.close();
    if !writer_done && tokio::time::timeout(send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    let remaining = state
        .active_sessions
        .fetch_sub(1, Ordering::SeqCst)
        .saturating_sub(1);
    metrics::set_client_sessions(remaining);
    tracing::info!(session_id = %session_id, "Client disconnected");
}

fn handle_request(session: &mut ClientSession, raw: &str) {
    match session.subscribe(raw) {
        Ok(outcome) => {
            if let Some(message) = outcome.error_message() {
                session.send(&message);
            }
        }
        Err(err) => {
            session.send(&err.to_message());
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    outbound: Arc<OutboundQueue>,
    send_timeout: Duration,
    session_id: SessionId,
) {
    while let Some(frame) = outbound.pop().await {
        let started = Instant::now();
        let send = sink.send(Message::Text(frame.as_str().to_owned().into()));
        match tokio::time::timeout(send_timeout, send).await {
            Ok(Ok(())) => metrics::record_frame_sent(started.elapsed()),
            Ok(Err(e)) => {
                tracing::debug!(session_id = %session_id, error = %e, "Client write failed");
                return;
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    timeout_secs = send_timeout.as_secs(),
                    "Client send timed out, disconnecting"
                );
                return;
            }
        }
    }

    let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(None))).await;
}

// =============================================================================
// Errors
// =============================================================================

/// Relay server errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use futures::stream;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MockFeedConnector;
    use crate::domain::subscription::{Exchange, StreamType};
    use crate::infrastructure::upstream::UpstreamConfig;

    fn state() -> Arc<RelayState> {
        let mut mock = MockFeedConnector::new();
        mock.expect_connect()
            .returning(|_| Ok(stream::pending().boxed()));
        let registry = Arc::new(UpstreamRegistry::new(Arc::new(mock), UpstreamConfig::default()));
        let router = Arc::new(Router::new(Exchange::all().to_vec(), StreamType::default()));
        Arc::new(RelayState::new(
            registry,
            router,
            SessionConfig::default(),
            "/market-stream",
            CancellationToken::new(),
        ))
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unknown_path_is_plain_text_404() {
        let response = app(state())
            .oneshot(
                HttpRequest::builder()
                    .uri("/other")
                    .header(header::HOST, "localhost:9800")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers()[header::CONNECTION], "close");
        assert_eq!(
            body_text(response).await,
            "WebSocket path invalid. Use ws://localhost:9800/market-stream"
        );
    }

    #[tokio::test]
    async fn root_serves_landing_page() {
        let response = app(state())
            .oneshot(HttpRequest::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("running"));
    }

    #[tokio::test]
    async fn plain_get_on_stream_path_serves_landing_page() {
        let response = app(state())
            .oneshot(
                HttpRequest::builder()
                    .uri("/market-stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("ws://localhost/market-stream"));
    }

    #[tokio::test]
    async fn hostile_host_header_is_not_echoed() {
        let response = app(state())
            .oneshot(
                HttpRequest::builder()
                    .uri("/")
                    .header(header::HOST, "<script>alert(1)</script>")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = body_text(response).await;
        assert!(!body.contains("<script>"));
        assert!(body.contains("ws://localhost/market-stream"));
    }

    #[test]
    fn host_keeps_names_addresses_and_ports() {
        let mut headers = HeaderMap::new();
        for value in ["relay.example.com:9800", "127.0.0.1:9800", "[::1]:9800"] {
            headers.insert(header::HOST, value.parse().unwrap());
            assert_eq!(host(&headers), value);
        }

        headers.insert(header::HOST, "evil.com\"><img".parse().unwrap());
        assert_eq!(host(&headers), "localhost");
    }

    #[test]
    fn shutdown_flag_follows_token() {
        let state = state();
        assert!(!state.is_shutting_down());
        state.shutdown.cancel();
        assert!(state.is_shutting_down());
    }
}
