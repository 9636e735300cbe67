//! SSE messages and the fluent builder used to send them.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::connection::Connection;
use crate::error::{SseError, SseResult};

/// Comment written by the writer loop when keep-alive is enabled.
pub(crate) const KEEP_ALIVE_COMMENT: &[u8] = b": keepalive\n\n";

/// A single Server-Sent Event.
///
/// A message has an optional `id`, an optional `event` name and a data
/// payload. Empty `id` or `event` values are treated as absent and never
/// reach the wire.
///
/// # Example
///
/// ```
/// use sse_conduit::Message;
///
/// let message = Message::new("hello").with_id("7").with_event("greeting");
///
/// assert_eq!(&message.to_bytes()[..], b"id: 7\nevent: greeting\ndata: hello\n\n");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    id: Option<String>,
    event: Option<String>,
    data: Bytes,
}

impl Message {
    /// Create a message carrying `data` with no id or event name.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    /// Create a message whose data is the JSON encoding of `value`.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> SseResult<Self> {
        let data =
            serde_json::to_vec(value).map_err(|e| SseError::serialization_failed(e.to_string()))?;
        Ok(Self::new(data))
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the event name.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    /// Get the event id, if set and non-empty.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Get the event name, if set and non-empty.
    pub fn event(&self) -> Option<&str> {
        self.event.as_deref().filter(|event| !event.is_empty())
    }

    /// Get the payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Encode the message in SSE wire format.
    ///
    /// ```text
    /// id: <id>
    /// event: <event>
    /// data: <data>
    ///
    /// ```
    ///
    /// Every line break in the data (`\n`, `\r` or `\r\n`) starts a new
    /// `data:` line, so the client reassembles the payload with `\n` between
    /// lines and data can never add fields of its own.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len_hint());

        if let Some(id) = self.id() {
            put_field(&mut buf, b"id", id.as_bytes());
        }

        if let Some(event) = self.event() {
            put_field(&mut buf, b"event", event.as_bytes());
        }

        let mut rest = &self.data[..];
        while let Some(end) = rest.iter().position(|b| matches!(b, b'\r' | b'\n')) {
            put_field(&mut buf, b"data", &rest[..end]);
            let crlf = rest[end] == b'\r' && rest.get(end + 1) == Some(&b'\n');
            rest = &rest[end + if crlf { 2 } else { 1 }..];
        }
        put_field(&mut buf, b"data", rest);

        buf.put_u8(b'\n');
        buf.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        let id = self.id().map_or(0, |id| id.len() + 5);
        let event = self.event().map_or(0, |event| event.len() + 8);
        id + event + self.data.len() + 8
    }
}

fn put_field(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    buf.put_slice(name);
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_u8(b'\n');
}

impl From<String> for Message {
    fn from(data: String) -> Self {
        Self::new(data)
    }
}

impl From<&str> for Message {
    fn from(data: &str) -> Self {
        Self::new(data.to_owned())
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

/// Fluent builder for sending one event on a [`Connection`].
///
/// Every `send_*` method consumes the builder, so a builder sends at most one
/// message.
///
/// ```rust,no_run
/// # async fn demo(connection: sse_conduit::Connection) -> sse_conduit::SseResult<()> {
/// connection
///     .build_message()
///     .with_id("42")
///     .with_event("update")
///     .send_string("payload")
///     .await
/// # }
/// ```
#[derive(Debug)]
#[must_use = "a message builder does nothing until one of its send methods is awaited"]
pub struct MessageBuilder<'a> {
    message: Message,
    connection: &'a Connection,
}

impl<'a> MessageBuilder<'a> {
    pub(crate) fn new(connection: &'a Connection) -> Self {
        Self {
            message: Message::default(),
            connection,
        }
    }

    /// Add an id to the event.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.message = self.message.with_id(id);
        self
    }

    /// Add an event name to the event.
    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.message = self.message.with_event(event);
        self
    }

    /// Send raw bytes as the event data.
    pub async fn send_bytes(mut self, data: impl Into<Bytes>) -> SseResult<()> {
        self.message.data = data.into();
        self.connection.send_message(self.message).await
    }

    /// Send a string as the event data.
    pub async fn send_string(self, data: impl Into<String>) -> SseResult<()> {
        self.send_bytes(data.into()).await
    }

    /// Serialize `value` as JSON and send it as the event data.
    ///
    /// Nothing is sent if serialization fails.
    pub async fn send_json<T: Serialize + ?Sized>(self, value: &T) -> SseResult<()> {
        let Message { data, .. } = Message::json(value)?;
        self.send_bytes(data).await
    }
}
