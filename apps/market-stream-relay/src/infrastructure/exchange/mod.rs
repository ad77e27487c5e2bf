//! Exchange WebSocket Adapters
//!
//! Production [`FeedConnector`](crate::application::ports::FeedConnector)
//! for Binance-style raw streams (Binance and Binance US share the protocol).

pub mod binance;
pub mod heartbeat;

pub use binance::{WebSocketConnector, WebSocketConnectorConfig};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
