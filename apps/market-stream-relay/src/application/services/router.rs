//! Request Router
//!
//! Parses client control messages and applies them to a session.
//!
//! # Request format
//!
//! ```json
//! {"exchange": "binance", "action": "subscribe", "pair": ["btcusdt", "ethusdt"]}
//! ```
//!
//! Pairs are validated one by one: valid pairs proceed, invalid ones are
//! reported back in `rejected`. A request where every pair is invalid fails
//! as a whole.

use serde_json::Value;

use super::session::ClientSession;
use crate::domain::protocol::{Action, RequestError, ServerMessage};
use crate::domain::subscription::{Exchange, StreamType, SubscriptionKey};
use crate::infrastructure::metrics;

/// A validated control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Target exchange.
    pub exchange: Exchange,
    /// Subscribe or unsubscribe.
    pub action: Action,
    /// Keys for the valid pairs, deduplicated, in request order.
    pub keys: Vec<SubscriptionKey>,
    /// Raw values of the rejected pairs.
    pub rejected: Vec<String>,
}

/// Result of applying a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// The action applied.
    pub action: Action,
    /// Keys whose membership actually changed.
    pub applied: Vec<SubscriptionKey>,
    /// Pairs that were not applied.
    pub rejected: Vec<String>,
}

impl RequestOutcome {
    /// Frame to send the client for a partial success, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<ServerMessage> {
        if self.rejected.is_empty() {
            None
        } else {
            Some(ServerMessage::rejected(
                "Some pairs were rejected",
                self.rejected.clone(),
            ))
        }
    }
}

/// Validates control messages against the supported exchanges.
#[derive(Debug, Clone)]
pub struct Router {
    exchanges: Vec<Exchange>,
    stream_type: StreamType,
}

impl Router {
    /// Create a router for the given exchanges and stream type.
    #[must_use]
    pub const fn new(exchanges: Vec<Exchange>, stream_type: StreamType) -> Self {
        Self {
            exchanges,
            stream_type,
        }
    }

    /// Supported exchanges.
    #[must_use]
    pub fn exchanges(&self) -> &[Exchange] {
        &self.exchanges
    }

    /// Parse and validate a raw control message.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for malformed JSON, missing fields, or when
    /// every pair is rejected; `UnsupportedExchange` for an exchange outside
    /// the configured set.
    pub fn parse(&self, raw: &str) -> Result<ClientRequest, RequestError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|_| RequestError::invalid("malformed JSON"))?;
        let Value::Object(fields) = value else {
            return Err(RequestError::invalid("expected a JSON object"));
        };

        let exchange_name = fields
            .get("exchange")
            .and_then(Value::as_str)
            .ok_or_else(|| RequestError::invalid("missing exchange"))?;
        let exchange = Exchange::parse(exchange_name)
            .filter(|e| self.exchanges.contains(e))
            .ok_or_else(|| RequestError::UnsupportedExchange(exchange_name.to_string()))?;

        let action = fields
            .get("action")
            .and_then(Value::as_str)
            .and_then(Action::parse)
            .ok_or_else(|| RequestError::invalid("action must be subscribe or unsubscribe"))?;

        let pairs = match fields.get("pair") {
            Some(Value::Array(pairs)) if !pairs.is_empty() => pairs,
            _ => return Err(RequestError::invalid("pair must be a non-empty array")),
        };

        let mut keys: Vec<SubscriptionKey> = Vec::with_capacity(pairs.len());
        let mut rejected = Vec::new();
        for pair in pairs {
            let key = pair
                .as_str()
                .and_then(|raw| SubscriptionKey::from_raw_pair(exchange, raw, &self.stream_type));
            match key {
                Some(key) if !keys.contains(&key) => keys.push(key),
                Some(_) => {}
                None => rejected.push(rejected_label(pair)),
            }
        }

        if keys.is_empty() {
            return Err(RequestError::InvalidRequest {
                reason: "no valid pairs".to_string(),
                rejected,
            });
        }

        Ok(ClientRequest {
            exchange,
            action,
            keys,
            rejected,
        })
    }

    /// Parse a control message and apply it to `session`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is rejected as a whole. The session's
    /// subscriptions are unchanged in that case.
    pub fn handle(
        &self,
        session: &mut ClientSession,
        raw: &str,
    ) -> Result<RequestOutcome, RequestError> {
        if !session.is_active() {
            return Err(RequestError::SessionClosed);
        }

        let request = match self.parse(raw) {
            Ok(request) => request,
            Err(err) => {
                metrics::record_client_request("unknown", err.kind());
                tracing::debug!(session_id = %session.id(), error = %err, "Rejected request");
                return Err(err);
            }
        };

        let mut applied = Vec::new();
        let mut rejected = request.rejected;

        for key in request.keys {
            match request.action {
                Action::Subscribe => match session.acquire(&key) {
                    Ok(true) => applied.push(key),
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(session_id = %session.id(), key = %key, error = %err, "Subscribe refused");
                        rejected.push(key.pair().to_string());
                    }
                },
                Action::Unsubscribe => {
                    if session.release(&key) {
                        applied.push(key);
                    }
                }
            }
        }

        let outcome = if rejected.is_empty() { "ok" } else { "partial" };
        metrics::record_client_request(request.action.as_str(), outcome);
        tracing::info!(
            session_id = %session.id(),
            exchange = %request.exchange,
            action = request.action.as_str(),
            applied = applied.len(),
            rejected = rejected.len(),
            "Applied request"
        );

        Ok(RequestOutcome {
            action: request.action,
            applied,
            rejected,
        })
    }
}

/// Text used to report a rejected pair back to the client.
fn rejected_label(pair: &Value) -> String {
    match pair {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
