//! Connection configuration.
//!
//! Everything here is optional. The defaults keep the wire output limited to
//! the events producers send.

use std::time::Duration;

/// Default depth of the frame channel between [`BodySink`](crate::BodySink)
/// and its response body.
pub const DEFAULT_BODY_BUFFER: usize = 16;

/// Configuration for an SSE connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseConfig {
    /// Interval for `: keepalive` comments. `None` disables them.
    pub keep_alive_interval: Option<Duration>,
    /// Upper bound on how long a producer waits for the writer loop to accept
    /// a message. `None` waits until the loop accepts or stops.
    pub send_timeout: Option<Duration>,
    /// Number of flushed frames a [`BodySink`](crate::BodySink) may queue
    /// ahead of the HTTP body.
    pub body_buffer: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: None,
            send_timeout: None,
            body_buffer: DEFAULT_BODY_BUFFER,
        }
    }
}

impl SseConfig {
    /// Create a new configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for configuration.
    pub fn builder() -> SseConfigBuilder {
        SseConfigBuilder::default()
    }

    /// Set the keep-alive interval.
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Disable keep-alive comments.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive_interval = None;
        self
    }

    /// Set the send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the body frame buffer.
    pub fn with_body_buffer(mut self, frames: usize) -> Self {
        self.body_buffer = frames.max(1);
        self
    }
}

/// Builder for [`SseConfig`].
#[derive(Debug, Default)]
pub struct SseConfigBuilder {
    keep_alive_interval: Option<Duration>,
    send_timeout: Option<Duration>,
    body_buffer: Option<usize>,
}

impl SseConfigBuilder {
    /// Set the keep-alive interval.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set the body frame buffer.
    pub fn body_buffer(mut self, frames: usize) -> Self {
        self.body_buffer = Some(frames);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> SseConfig {
        let mut config = SseConfig {
            keep_alive_interval: self.keep_alive_interval,
            send_timeout: self.send_timeout,
            ..SseConfig::default()
        };

        if let Some(frames) = self.body_buffer {
            config.body_buffer = frames.max(1);
        }

        config
    }
}
