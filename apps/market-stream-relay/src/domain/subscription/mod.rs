//! Subscription Keys
//!
//! Domain types identifying upstream exchange feed streams.
//!
//! # Design
//!
//! A [`SubscriptionKey`] names exactly one upstream stream: the exchange it
//! lives on plus the normalized stream name (`<pair>@<stream type>`).
//! Normalization happens once, when a client request is ingested; after that
//! keys compare by exact equality.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// =============================================================================
// Session Identity
// =============================================================================

/// Source of generated session ids. Starts high so ids built with
/// [`SessionId::new`] in fixtures never collide with generated ones.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1 << 32);

/// Opaque identifier of a connected client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a session id from a raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate the next process-unique session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// =============================================================================
// Exchange
// =============================================================================

/// Exchanges whose public streams can be relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    /// Binance global spot streams.
    Binance,
    /// Binance.US spot streams.
    BinanceUs,
}

impl Exchange {
    /// Get all known exchanges.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Binance, Self::BinanceUs]
    }

    /// Parse an exchange identifier, ignoring case and surrounding whitespace.
    #[must_use]
    pub fn parse(identifier: &str) -> Option<Self> {
        match identifier.trim().to_lowercase().as_str() {
            "binance" => Some(Self::Binance),
            "binance_us" | "binanceus" => Some(Self::BinanceUs),
            _ => None,
        }
    }

    /// Get the identifier used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::BinanceUs => "binance_us",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stream Type
// =============================================================================

/// Stream type suffix appended to each pair (`btcusdt@trade`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamType(String);

impl StreamType {
    /// Create a stream type, trimming whitespace and a leading `@`.
    ///
    /// Case is kept as given: exchange stream names such as `aggTrade` or
    /// `kline_1M` are case-sensitive. Returns `None` for an empty suffix.
    #[must_use]
    pub fn new(suffix: &str) -> Option<Self> {
        let suffix = suffix.trim().trim_start_matches('@').trim();
        if suffix.is_empty() {
            None
        } else {
            Some(Self(suffix.to_string()))
        }
    }

    /// Get the suffix without the `@` separator.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StreamType {
    fn default() -> Self {
        Self("trade".to_string())
    }
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Normalized identifier of one upstream feed stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubscriptionKey {
    exchange: Exchange,
    stream: String,
}

impl SubscriptionKey {
    /// Build a key from an already-normalized pair.
    #[must_use]
    pub fn new(exchange: Exchange, pair: &str, stream_type: &StreamType) -> Self {
        Self {
            exchange,
            stream: format!("{pair}@{}", stream_type.as_str()),
        }
    }

    /// Normalize a raw client pair and build a key from it.
    ///
    /// Returns `None` if the pair is not a valid symbol after normalization.
    #[must_use]
    pub fn from_raw_pair(exchange: Exchange, raw: &str, stream_type: &StreamType) -> Option<Self> {
        normalize_pair(raw).map(|pair| Self::new(exchange, &pair, stream_type))
    }

    /// Get the exchange this stream belongs to.
    #[must_use]
    pub const fn exchange(&self) -> Exchange {
        self.exchange
    }

    /// Get the stream name, e.g. `btcusdt@trade`.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Get the pair part of the stream name.
    #[must_use]
    pub fn pair(&self) -> &str {
        self.stream
            .split_once('@')
            .map_or(self.stream.as_str(), |(pair, _)| pair)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.stream)
    }
}

/// Normalize a raw pair: trim and lowercase.
///
/// Only ASCII alphanumeric symbols are accepted so a client cannot smuggle a
/// different stream type or path segment into the upstream URL.
#[must_use]
pub fn normalize_pair(raw: &str) -> Option<String> {
    let normalized = raw.trim().to_lowercase();
    if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(normalized)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("btcusdt", Some("btcusdt"); "already normalized")]
    #[test_case("  BTCUSDT ", Some("btcusdt"); "trimmed and lowercased")]
    #[test_case("EthUsdt", Some("ethusdt"); "mixed case")]
    #[test_case("", None; "empty")]
    #[test_case("   ", None; "whitespace only")]
    #[test_case("btcusdt@depth", None; "stream injection")]
    #[test_case("btc/usdt", None; "path separator")]
    fn pair_normalization(raw: &str, expected: Option<&str>) {
        assert_eq!(normalize_pair(raw).as_deref(), expected);
    }

    #[test]
    fn key_from_raw_pair() {
        let key =
            SubscriptionKey::from_raw_pair(Exchange::Binance, " BTCUSDT", &StreamType::default())
                .unwrap();
        assert_eq!(key.stream(), "btcusdt@trade");
        assert_eq!(key.pair(), "btcusdt");
        assert_eq!(key.exchange(), Exchange::Binance);
        assert_eq!(key.to_string(), "binance:btcusdt@trade");
    }

    #[test]
    fn keys_on_different_exchanges_differ() {
        let stream_type = StreamType::default();
        let a = SubscriptionKey::new(Exchange::Binance, "btcusdt", &stream_type);
        let b = SubscriptionKey::new(Exchange::BinanceUs, "btcusdt", &stream_type);
        assert_ne!(a, b);
        assert_eq!(a.stream(), b.stream());
    }

    #[test]
    fn exchange_parsing() {
        assert_eq!(Exchange::parse("binance"), Some(Exchange::Binance));
        assert_eq!(Exchange::parse(" Binance "), Some(Exchange::Binance));
        assert_eq!(Exchange::parse("binance_us"), Some(Exchange::BinanceUs));
        assert_eq!(Exchange::parse("unknown"), None);
    }

    #[test]
    fn stream_type_keeps_case() {
        assert_eq!(StreamType::new("@aggTrade").unwrap().as_str(), "aggTrade");
        assert_eq!(StreamType::new(" bookTicker ").unwrap().as_str(), "bookTicker");
        assert_eq!(StreamType::new("kline_1M").unwrap().as_str(), "kline_1M");
        assert!(StreamType::new("").is_none());
        assert!(StreamType::new(" @ ").is_none());
        assert_eq!(StreamType::default().as_str(), "trade");
    }

    #[test]
    fn key_lowercases_pair_but_not_stream_type() {
        let stream_type = StreamType::new("aggTrade").unwrap();
        let key = SubscriptionKey::from_raw_pair(Exchange::Binance, "BTCUSDT", &stream_type).unwrap();
        assert_eq!(key.stream(), "btcusdt@aggTrade");
        assert_eq!(key.pair(), "btcusdt");
    }

    #[test]
    fn session_id_display_is_hex() {
        assert_eq!(SessionId::new(255).to_string(), "00000000000000ff");
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn generated_session_ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| SessionId::generate()).collect::<Vec<_>>()))
            .collect();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate session id {id}");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
