//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Unparseable numeric values fall back to their defaults. Values that parse
//! but cannot work (empty exchange list, zero capacity or interval, a
//! shrinking backoff) are errors.

use std::time::Duration;

use crate::domain::session::OverflowPolicy;
use crate::domain::subscription::{Exchange, StreamType};

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Client WebSocket port.
    pub port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
    /// Path clients upgrade on.
    pub stream_path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 9800,
            health_port: 8082,
            stream_path: "/market-stream".to_string(),
        }
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Binance raw stream base URL.
    pub binance_url: String,
    /// Binance US raw stream base URL.
    pub binance_us_url: String,
    /// Upper bound on connect plus handshake.
    pub connect_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Jitter fraction applied to each delay.
    pub reconnect_jitter: f64,
    /// Failed attempts before subscribers are told the feed is degraded.
    pub degraded_after_attempts: u32,
    /// Heartbeat check interval.
    pub heartbeat_interval: Duration,
    /// Silence before the upstream is considered dead.
    pub heartbeat_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            binance_url: "wss://stream.binance.com:9443/ws".to_string(),
            binance_us_url: "wss://stream.binance.us:9443/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_secs(1),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.2,
            degraded_after_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-client session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound queue capacity per client.
    pub outbound_queue_capacity: usize,
    /// What to drop when a client's queue is full.
    pub overflow_policy: OverflowPolicy,
    /// Bound on a single write to a client.
    pub send_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listener settings.
    pub server: ServerSettings,
    /// Upstream feed settings.
    pub upstream: UpstreamSettings,
    /// Per-client session settings.
    pub session: SessionSettings,
    /// Exchanges clients may subscribe to.
    pub exchanges: Vec<Exchange>,
    /// Stream suffix appended to every pair.
    pub stream_type: StreamType,
    /// Bound on closing upstreams during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
            session: SessionSettings::default(),
            exchanges: Exchange::all().to_vec(),
            stream_type: StreamType::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is structurally invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is structurally invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let stream_path = env
            .string("RELAY_STREAM_PATH")
            .unwrap_or(defaults.server.stream_path);
        if !stream_path.starts_with('/') {
            return Err(ConfigError::InvalidStreamPath(stream_path));
        }

        let server = ServerSettings {
            port: env.parse("RELAY_PORT", defaults.server.port),
            health_port: env.parse("RELAY_HEALTH_PORT", defaults.server.health_port),
            stream_path,
        };

        let upstream = UpstreamSettings {
            binance_url: env
                .string("BINANCE_STREAM_URL")
                .unwrap_or(defaults.upstream.binance_url),
            binance_us_url: env
                .string("BINANCE_US_STREAM_URL")
                .unwrap_or(defaults.upstream.binance_us_url),
            connect_timeout: env.duration_secs(
                "RELAY_CONNECT_TIMEOUT_SECS",
                defaults.upstream.connect_timeout,
            ),
            reconnect_delay_initial: env.duration_millis(
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                defaults.upstream.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "RELAY_RECONNECT_DELAY_MAX_SECS",
                defaults.upstream.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                defaults.upstream.reconnect_delay_multiplier,
            ),
            reconnect_jitter: Some(
                env.parse("RELAY_RECONNECT_JITTER", defaults.upstream.reconnect_jitter),
            )
            .filter(|j: &f64| j.is_finite())
            .map_or(defaults.upstream.reconnect_jitter, |j| j.clamp(0.0, 1.0)),
            degraded_after_attempts: env.parse(
                "RELAY_DEGRADED_AFTER_ATTEMPTS",
                defaults.upstream.degraded_after_attempts,
            ),
            heartbeat_interval: env.duration_secs(
                "RELAY_HEARTBEAT_INTERVAL_SECS",
                defaults.upstream.heartbeat_interval,
            ),
            heartbeat_timeout: env.duration_secs(
                "RELAY_HEARTBEAT_TIMEOUT_SECS",
                defaults.upstream.heartbeat_timeout,
            ),
        };
        validate_upstream(&upstream)?;

        let outbound_queue_capacity = env.parse(
            "RELAY_OUTBOUND_QUEUE_CAPACITY",
            defaults.session.outbound_queue_capacity,
        );
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity(
                "RELAY_OUTBOUND_QUEUE_CAPACITY".to_string(),
            ));
        }

        let overflow_policy = match env.string("RELAY_OVERFLOW_POLICY") {
            Some(name) => OverflowPolicy::parse(&name)
                .ok_or(ConfigError::UnknownOverflowPolicy(name))?,
            None => defaults.session.overflow_policy,
        };

        let session = SessionSettings {
            outbound_queue_capacity,
            overflow_policy,
            send_timeout: env.duration_secs(
                "RELAY_SEND_TIMEOUT_SECS",
                defaults.session.send_timeout,
            ),
        };
        require_nonzero("RELAY_SEND_TIMEOUT_SECS", session.send_timeout)?;

        let exchanges = match env.string("RELAY_EXCHANGES") {
            Some(list) => parse_exchanges(&list)?,
            None => defaults.exchanges,
        };

        let stream_type = match env.string("RELAY_STREAM_TYPE") {
            Some(suffix) => {
                StreamType::new(&suffix).ok_or(ConfigError::InvalidStreamType(suffix))?
            }
            None => defaults.stream_type,
        };

        Ok(Self {
            server,
            upstream,
            session,
            exchanges,
            stream_type,
            shutdown_timeout: env
                .duration_secs("RELAY_SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout),
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A capacity was set to zero.
    #[error("{0} must be greater than zero")]
    ZeroCapacity(String),
    /// Overflow policy name not recognized.
    #[error("unknown overflow policy: {0} (expected drop_oldest or drop_newest)")]
    UnknownOverflowPolicy(String),
    /// Exchange list is empty.
    #[error("RELAY_EXCHANGES must name at least one exchange")]
    NoExchanges,
    /// Exchange identifier not recognized.
    #[error("unknown exchange: {0}")]
    UnknownExchange(String),
    /// Stream path does not start with `/`.
    #[error("stream path must start with '/': {0}")]
    InvalidStreamPath(String),
    /// Stream type suffix is empty or malformed.
    #[error("invalid stream type: {0}")]
    InvalidStreamType(String),
    /// An interval or timeout was set to zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(String),
    /// Reconnect backoff values cannot produce a growing delay.
    #[error("invalid reconnect backoff: {0}")]
    InvalidBackoff(String),
}

fn require_nonzero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration(key.to_string()));
    }
    Ok(())
}

fn validate_upstream(upstream: &UpstreamSettings) -> Result<(), ConfigError> {
    require_nonzero("RELAY_CONNECT_TIMEOUT_SECS", upstream.connect_timeout)?;
    require_nonzero("RELAY_HEARTBEAT_INTERVAL_SECS", upstream.heartbeat_interval)?;
    require_nonzero("RELAY_HEARTBEAT_TIMEOUT_SECS", upstream.heartbeat_timeout)?;

    if upstream.reconnect_delay_initial.is_zero() {
        return Err(ConfigError::InvalidBackoff(
            "RELAY_RECONNECT_DELAY_INITIAL_MS must be greater than zero".to_string(),
        ));
    }
    let multiplier = upstream.reconnect_delay_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::InvalidBackoff(format!(
            "RELAY_RECONNECT_DELAY_MULTIPLIER must be at least 1.0, got {multiplier}"
        )));
    }
    if upstream.reconnect_delay_max < upstream.reconnect_delay_initial {
        return Err(ConfigError::InvalidBackoff(format!(
            "RELAY_RECONNECT_DELAY_MAX_SECS ({:?}) is below the initial delay ({:?})",
            upstream.reconnect_delay_max, upstream.reconnect_delay_initial
        )));
    }
    Ok(())
}

fn parse_exchanges(list: &str) -> Result<Vec<Exchange>, ConfigError> {
    let mut exchanges = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let exchange =
            Exchange::parse(name).ok_or_else(|| ConfigError::UnknownExchange(name.to_string()))?;
        if !exchanges.contains(&exchange) {
            exchanges.push(exchange);
        }
    }
    if exchanges.is_empty() {
        return Err(ConfigError::NoExchanges);
    }
    Ok(exchanges)
}

/// Variable source with fall-back-to-default parsing.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.string(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.string(key)
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RelayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();

        assert_eq!(config.server.port, 9800);
        assert_eq!(config.server.health_port, 8082);
        assert_eq!(config.server.stream_path, "/market-stream");
        assert_eq!(config.exchanges, vec![Exchange::Binance, Exchange::BinanceUs]);
        assert_eq!(config.stream_type.as_str(), "trade");
        assert_eq!(config.upstream.binance_url, "wss://stream.binance.com:9443/ws");
        assert_eq!(config.upstream.reconnect_delay_initial, Duration::from_secs(1));
        assert_eq!(config.upstream.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(config.upstream.degraded_after_attempts, 5);
        assert_eq!(config.session.outbound_queue_capacity, 1024);
        assert_eq!(config.session.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("RELAY_PORT", "9900"),
            ("RELAY_STREAM_PATH", "/feed"),
            ("RELAY_EXCHANGES", "binance_us"),
            ("RELAY_STREAM_TYPE", "@depth"),
            ("RELAY_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("RELAY_OVERFLOW_POLICY", "drop-newest"),
            ("RELAY_OUTBOUND_QUEUE_CAPACITY", "16"),
        ])
        .unwrap();

        assert_eq!(config.server.port, 9900);
        assert_eq!(config.server.stream_path, "/feed");
        assert_eq!(config.exchanges, vec![Exchange::BinanceUs]);
        assert_eq!(config.stream_type.as_str(), "depth");
        assert_eq!(config.upstream.reconnect_delay_initial, Duration::from_millis(250));
        assert_eq!(config.session.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.session.outbound_queue_capacity, 16);
    }

    #[test]
    fn unparseable_numbers_fall_back() {
        let config = load(&[("RELAY_PORT", "not-a-port"), ("RELAY_SEND_TIMEOUT_SECS", "-1")]).unwrap();
        assert_eq!(config.server.port, 9800);
        assert_eq!(config.session.send_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            load(&[("RELAY_OUTBOUND_QUEUE_CAPACITY", "0")]).unwrap_err(),
            ConfigError::ZeroCapacity("RELAY_OUTBOUND_QUEUE_CAPACITY".to_string())
        );
    }

    #[test]
    fn unknown_overflow_policy_is_rejected() {
        assert_eq!(
            load(&[("RELAY_OVERFLOW_POLICY", "block")]).unwrap_err(),
            ConfigError::UnknownOverflowPolicy("block".to_string())
        );
    }

    #[test]
    fn exchange_list_validation() {
        assert_eq!(load(&[("RELAY_EXCHANGES", " , ")]).unwrap_err(), ConfigError::NoExchanges);
        assert_eq!(
            load(&[("RELAY_EXCHANGES", "binance,kraken")]).unwrap_err(),
            ConfigError::UnknownExchange("kraken".to_string())
        );
        assert_eq!(
            load(&[("RELAY_EXCHANGES", "binance,BINANCE")]).unwrap().exchanges,
            vec![Exchange::Binance]
        );
    }

    #[test]
    fn stream_path_must_be_absolute() {
        assert_eq!(
            load(&[("RELAY_STREAM_PATH", "market-stream")]).unwrap_err(),
            ConfigError::InvalidStreamPath("market-stream".to_string())
        );
    }

    #[test_case("RELAY_HEARTBEAT_INTERVAL_SECS" ; "heartbeat interval")]
    #[test_case("RELAY_HEARTBEAT_TIMEOUT_SECS" ; "heartbeat timeout")]
    #[test_case("RELAY_CONNECT_TIMEOUT_SECS" ; "connect timeout")]
    #[test_case("RELAY_SEND_TIMEOUT_SECS" ; "send timeout")]
    fn zero_duration_is_rejected(key: &str) {
        assert_eq!(
            load(&[(key, "0")]).unwrap_err(),
            ConfigError::ZeroDuration(key.to_string())
        );
    }

    #[test_case(&[("RELAY_RECONNECT_DELAY_INITIAL_MS", "0")] ; "zero initial delay")]
    #[test_case(&[("RELAY_RECONNECT_DELAY_MULTIPLIER", "0.5")] ; "shrinking multiplier")]
    #[test_case(&[("RELAY_RECONNECT_DELAY_MULTIPLIER", "NaN")] ; "nan multiplier")]
    #[test_case(&[("RELAY_RECONNECT_DELAY_MULTIPLIER", "inf")] ; "infinite multiplier")]
    #[test_case(&[("RELAY_RECONNECT_DELAY_MAX_SECS", "0")] ; "zero max delay")]
    #[test_case(
        &[("RELAY_RECONNECT_DELAY_INITIAL_MS", "5000"), ("RELAY_RECONNECT_DELAY_MAX_SECS", "2")]
        ; "max below initial"
    )]
    fn bad_backoff_is_rejected(vars: &[(&str, &str)]) {
        assert!(matches!(load(vars), Err(ConfigError::InvalidBackoff(_))));
    }

    #[test]
    fn flat_backoff_is_accepted() {
        let config = load(&[
            ("RELAY_RECONNECT_DELAY_INITIAL_MS", "2000"),
            ("RELAY_RECONNECT_DELAY_MAX_SECS", "2"),
            ("RELAY_RECONNECT_DELAY_MULTIPLIER", "1.0"),
        ])
        .unwrap();
        assert_eq!(config.upstream.reconnect_delay_max, config.upstream.reconnect_delay_initial);
    }

    #[test]
    fn jitter_is_clamped() {
        let config = load(&[("RELAY_RECONNECT_JITTER", "3.5")]).unwrap();
        assert!((config.upstream.reconnect_jitter - 1.0).abs() < f64::EPSILON);
    }
}
