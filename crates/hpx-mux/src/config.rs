//! Shared connection configuration.

use std::time::Duration;

use crate::reconnect::BackoffConfig;

/// Configuration for the shared connection and the subscriptions riding on it.
#[derive(Clone, Debug)]
pub struct MuxConfig {
    // URL
    /// WebSocket endpoint URL.
    pub url: String,

    // Handshake
    /// Literal first message the server must send to confirm the connection.
    pub ack_message: String,
    /// Upper bound for a whole connection attempt (None = wait indefinitely).
    pub connect_timeout: Option<Duration>,

    // Shutdown
    /// How long a graceful close waits for the peer's close frame.
    pub close_timeout: Duration,

    // Keepalive
    /// Interval between WebSocket ping frames (None = no pings).
    pub keepalive_interval: Option<Duration>,
    /// Maximum silence after a ping before the connection counts as lost.
    pub keepalive_timeout: Duration,

    // Inbound handling
    /// Maximum inbound message size in bytes (0 = unlimited).
    pub max_message_size: usize,
    /// Close the connection with 1002 on malformed envelopes instead of dropping them.
    pub strict_envelopes: bool,

    // Subscription retry
    /// Delay before the first retry after an abrupt closure.
    pub retry_initial_delay: Duration,
    /// Maximum delay between retries.
    pub retry_max_delay: Duration,
    /// Backoff multiplier for retry delays.
    pub retry_backoff_factor: f64,
    /// Random jitter factor (0.0-1.0) for retry delays.
    pub retry_jitter: f64,
    /// Maximum number of consecutive retries (None = infinite).
    pub retry_max_attempts: Option<u32>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            ack_message: "ack".to_string(),
            connect_timeout: None,
            close_timeout: Duration::from_secs(5),
            keepalive_interval: None,
            keepalive_timeout: Duration::from_secs(10),
            max_message_size: 16 * 1024 * 1024, // 16 MB
            strict_envelopes: false,
            retry_initial_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(5),
            retry_backoff_factor: 2.0,
            retry_jitter: 0.1,
            retry_max_attempts: None,
        }
    }
}

impl MuxConfig {
    /// Create a new configuration with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the acknowledgment literal.
    #[must_use]
    pub fn ack_message(mut self, ack: impl Into<String>) -> Self {
        self.ack_message = ack.into();
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the graceful close timeout.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the keepalive timeout.
    #[must_use]
    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    /// Set the maximum inbound message size.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set whether malformed envelopes close the connection.
    #[must_use]
    pub fn strict_envelopes(mut self, strict: bool) -> Self {
        self.strict_envelopes = strict;
        self
    }

    /// Set the initial retry delay.
    #[must_use]
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = delay;
        self
    }

    /// Set the maximum retry delay.
    #[must_use]
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Set the retry backoff factor.
    #[must_use]
    pub fn retry_backoff_factor(mut self, factor: f64) -> Self {
        self.retry_backoff_factor = factor;
        self
    }

    /// Set the retry jitter.
    #[must_use]
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Set the maximum consecutive retries.
    #[must_use]
    pub fn retry_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    pub(crate) fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.retry_initial_delay,
            max_delay: self.retry_max_delay,
            factor: self.retry_backoff_factor,
            jitter: self.retry_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        if self.ack_message.is_empty() {
            return Err("Ack message cannot be empty".to_string());
        }
        if self.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Connect timeout must be > 0".to_string());
        }
        if self.close_timeout.is_zero() {
            return Err("Close timeout must be > 0".to_string());
        }
        if self.keepalive_interval.is_some_and(|i| i.is_zero()) {
            return Err("Keepalive interval must be > 0".to_string());
        }
        if self.keepalive_timeout.is_zero() {
            return Err("Keepalive timeout must be > 0".to_string());
        }
        self.backoff().validate()?;
        Ok(())
    }
}
