//! Timing and backoff tuning for the channel.

use super::ConfigError;
use std::time::Duration;

/// Shortest accepted handshake timeout.
pub const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest accepted handshake timeout.
pub const MAX_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Largest accepted jitter, in permille of the delay.
pub const MAX_JITTER_PERMILLE: u16 = 1000;

/// Timeouts, keepalive and backoff parameters shared by all components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Upper bound on one association attempt.
    pub attach_timeout: Duration,
    /// Upper bound on one connect attempt (transport, TLS and upgrade).
    pub handshake_timeout: Duration,
    /// How often a ping is sent on an idle live session.
    pub keepalive_interval: Duration,
    /// Session is declared dead if nothing arrives for this long.
    pub keepalive_timeout: Duration,
    /// A session live this long counts as sustained success.
    pub stable_window: Duration,
    /// First retry delay.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_ceiling: Duration,
    /// Maximum per-device jitter subtracted from delays, in permille.
    pub jitter_permille: u16,
    /// Failure events kept in history.
    pub history_capacity: usize,
    /// Outbound frames waiting for the session task.
    pub outbound_queue: usize,
    /// Inbound frames waiting for the application.
    pub inbound_queue: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(60),
            stable_window: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_ceiling: Duration::from_secs(300),
            jitter_permille: 250,
            history_capacity: 32,
            outbound_queue: 16,
            inbound_queue: 64,
        }
    }
}

impl ChannelConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attach_timeout.is_zero() {
            return Err(ConfigError::InvalidTuning("attach_timeout must be > 0"));
        }
        if self.handshake_timeout < MIN_HANDSHAKE_TIMEOUT
            || self.handshake_timeout > MAX_HANDSHAKE_TIMEOUT
        {
            return Err(ConfigError::InvalidTuning(
                "handshake_timeout must be within 1..=120 s",
            ));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidTuning("keepalive_interval must be > 0"));
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(ConfigError::InvalidTuning(
                "keepalive_timeout must be > keepalive_interval",
            ));
        }
        if self.backoff_base.is_zero() {
            return Err(ConfigError::InvalidTuning("backoff_base must be > 0"));
        }
        if self.backoff_ceiling < self.backoff_base {
            return Err(ConfigError::InvalidTuning(
                "backoff_ceiling must be >= backoff_base",
            ));
        }
        if self.jitter_permille > MAX_JITTER_PERMILLE {
            return Err(ConfigError::InvalidTuning("jitter_permille must be <= 1000"));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::InvalidTuning("history_capacity must be > 0"));
        }
        if self.outbound_queue == 0 || self.inbound_queue == 0 {
            return Err(ConfigError::InvalidTuning("queue sizes must be > 0"));
        }
        Ok(())
    }
}
