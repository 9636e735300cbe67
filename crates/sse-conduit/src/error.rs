//! Error types for SSE connections.

use std::time::Duration;

use thiserror::Error;

/// Result type for SSE operations.
pub type SseResult<T> = Result<T, SseError>;

/// Errors that can occur while upgrading a response or sending events.
#[derive(Debug, Error)]
pub enum SseError {
    /// The response sink cannot flush incrementally, so it cannot stream.
    #[error("streaming not supported by response sink")]
    StreamingUnsupported,

    /// The connection was closed or the client disconnected.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Failed to serialize event data.
    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    /// Writing or flushing an event onto the transport failed.
    #[error("sse write error: {0}")]
    WriteFailed(String),

    /// The writer loop did not accept a message within the configured timeout.
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SseError {
    /// Create a connection closed error.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed(reason.into())
    }

    /// Create a serialization failed error.
    pub fn serialization_failed(reason: impl Into<String>) -> Self {
        Self::SerializationFailed(reason.into())
    }

    /// Create a write failed error.
    pub fn write_failed(reason: impl Into<String>) -> Self {
        Self::WriteFailed(reason.into())
    }

    /// Check if the caller can keep using the connection after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailed(_) | Self::WriteFailed(_) | Self::SendTimeout(_)
        )
    }

    /// Check if this error means no further events will reach the client.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StreamingUnsupported | Self::ConnectionClosed(_))
    }
}
