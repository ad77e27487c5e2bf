//! Upstream Heartbeat
//!
//! Liveness tracking for an exchange feed socket. The feed task ticks the
//! monitor on a fixed interval; any inbound frame counts as activity.
//!
//! Binance pings clients itself and expects a pong, so traffic normally
//! keeps the monitor satisfied. Our own pings only matter on quiet streams.

use std::time::{Duration, Instant};

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between liveness checks (and pings on a quiet socket).
    pub ping_interval: Duration,
    /// Silence after which the socket is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub const fn from_upstream_settings(settings: &crate::UpstreamSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the feed task should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Socket is busy; nothing to do.
    Idle,
    /// Socket has been quiet for an interval; send a ping.
    SendPing,
    /// No traffic within the timeout; drop the connection.
    TimedOut,
}

/// Tracks the last inbound activity on one socket.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    /// Create a monitor that treats `now` as the last activity.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_activity: now,
        }
    }

    /// Interval at which [`on_tick`](Self::on_tick) should be called.
    ///
    /// `None` when either the interval or the timeout is zero, which
    /// disables liveness checks for the socket.
    #[must_use]
    pub const fn interval(&self) -> Option<Duration> {
        if self.config.ping_interval.is_zero() || self.config.timeout.is_zero() {
            None
        } else {
            Some(self.config.ping_interval)
        }
    }

    /// Record inbound traffic (data, ping, or pong).
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Decide what to do at `now`.
    #[must_use]
    pub fn on_tick(&self, now: Instant) -> HeartbeatAction {
        let silent = now.saturating_duration_since(self.last_activity);
        if silent >= self.config.timeout {
            HeartbeatAction::TimedOut
        } else if silent >= self.config.ping_interval {
            HeartbeatAction::SendPing
        } else {
            HeartbeatAction::Idle
        }
    }
}
