//! The producer-side handle of an SSE connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::SseConfig;
use crate::error::{SseError, SseResult};
use crate::message::{Message, MessageBuilder};
use crate::sink::ResponseSink;
use crate::writer::{ErrorReporter, WriterLoop};

/// A unique identifier for an SSE connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message waiting to be taken by the writer loop.
///
/// The writer loop answers on `accepted` when it takes the message, which is
/// what lets [`Connection::send_message`] return only after the handoff.
#[derive(Debug)]
pub(crate) struct Handoff {
    pub(crate) message: Message,
    pub(crate) accepted: oneshot::Sender<()>,
}

/// Handle for pushing events to one upgraded SSE response.
///
/// Cloning is cheap and every clone talks to the same writer loop, so a
/// connection can be shared with any number of producer tasks. The writer
/// loop stops when the client disconnects, when [`close`](Self::close) is
/// called, or when the last handle is dropped.
///
/// Messages from a single producer reach the client in the order its sends
/// return. Sends from different producers are interleaved in whatever order
/// the writer loop receives them.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    messages: mpsc::Sender<Handoff>,
    shutdown: CancellationToken,
    errors: Mutex<mpsc::Receiver<SseError>>,
    error_waiters: Arc<AtomicUsize>,
    open: Arc<AtomicBool>,
    send_timeout: Option<Duration>,
}

impl Connection {
    /// Wire a new connection to `sink` and return it with its writer loop.
    ///
    /// The caller is responsible for spawning the loop.
    pub(crate) fn open<S: ResponseSink>(
        sink: S,
        disconnect: CancellationToken,
        config: &SseConfig,
    ) -> (Self, WriterLoop<S>) {
        let id = ConnectionId::new();
        let (messages_tx, messages_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let error_waiters = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let writer = WriterLoop::new(
            id,
            sink,
            messages_rx,
            shutdown.clone(),
            disconnect,
            Arc::clone(&open),
            ErrorReporter::new(id, errors_tx, Arc::clone(&error_waiters)),
            config.keep_alive_interval,
        );

        let connection = Self {
            inner: Arc::new(Inner {
                id,
                messages: messages_tx,
                shutdown,
                errors: Mutex::new(errors_rx),
                error_waiters,
                open,
                send_timeout: config.send_timeout,
            }),
        };

        (connection, writer)
    }

    /// Get the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Start a message with id and event fields.
    pub fn build_message(&self) -> MessageBuilder<'_> {
        MessageBuilder::new(self)
    }

    /// Send bytes as an event without id or event fields.
    pub async fn send_bytes(&self, data: impl Into<Bytes>) -> SseResult<()> {
        self.build_message().send_bytes(data).await
    }

    /// Send a string as an event without id or event fields.
    pub async fn send_string(&self, data: impl Into<String>) -> SseResult<()> {
        self.build_message().send_string(data).await
    }

    /// Send the JSON encoding of `value` as an event without id or event
    /// fields.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> SseResult<()> {
        self.build_message().send_json(value).await
    }

    /// Hand a message to the writer loop.
    ///
    /// Returns once the writer loop has taken the message. Fails with
    /// [`SseError::ConnectionClosed`] if the connection is closed, or becomes
    /// closed before the loop takes the message. With a send timeout
    /// configured, fails with [`SseError::SendTimeout`] instead of waiting
    /// longer; a timed-out message is never written.
    pub async fn send_message(&self, message: Message) -> SseResult<()> {
        if !self.is_open() {
            return Err(SseError::connection_closed("connection is closed"));
        }

        match self.inner.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.handoff(message))
                .await
                .map_err(|_| SseError::SendTimeout(limit))?,
            None => self.handoff(message).await,
        }
    }

    async fn handoff(&self, message: Message) -> SseResult<()> {
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let handoff = Handoff {
            message,
            accepted: accepted_tx,
        };

        self.inner
            .messages
            .send(handoff)
            .await
            .map_err(|_| SseError::connection_closed("writer stopped"))?;

        accepted_rx
            .await
            .map_err(|_| SseError::connection_closed("writer stopped before accepting message"))?;

        trace!(connection_id = %self.inner.id, "message handed to writer");
        Ok(())
    }

    /// Whether the connection still accepts events.
    ///
    /// This is the last state the writer loop published and may briefly lag a
    /// disconnect that is being processed.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Stop the writer loop.
    ///
    /// Every send that already returned has been written. Sends still waiting
    /// for the handoff fail with [`SseError::ConnectionClosed`]. The HTTP
    /// response itself is finished by the server once the body ends.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait for the next transport write failure.
    ///
    /// Failures are only delivered while some task is waiting here; otherwise
    /// the writer loop logs them and moves on. A failure that arrives while
    /// the wait is being cancelled is logged too, never handed to a later
    /// waiter. Returns `None` once the writer loop has stopped.
    pub async fn next_error(&self) -> Option<SseError> {
        let slot = self.inner.errors.lock().await;
        let mut wait = ErrorWait::register(slot, &self.inner.error_waiters, self.inner.id);
        wait.slot.recv().await
    }

    #[cfg(test)]
    pub(crate) fn error_waiters(&self) -> usize {
        self.inner.error_waiters.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// The task currently waiting in [`Connection::next_error`].
///
/// Holds the error slot and counts as a waiter until the wait ends or is
/// cancelled. The slot is emptied on both edges so an error always goes to
/// the waiter that was registered when it happened.
struct ErrorWait<'a> {
    slot: MutexGuard<'a, mpsc::Receiver<SseError>>,
    waiters: &'a AtomicUsize,
    connection_id: ConnectionId,
}

impl<'a> ErrorWait<'a> {
    fn register(
        mut slot: MutexGuard<'a, mpsc::Receiver<SseError>>,
        waiters: &'a AtomicUsize,
        connection_id: ConnectionId,
    ) -> Self {
        discard_unclaimed(&mut slot, connection_id);
        waiters.fetch_add(1, Ordering::AcqRel);
        Self {
            slot,
            waiters,
            connection_id,
        }
    }
}

impl Drop for ErrorWait<'_> {
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        discard_unclaimed(&mut self.slot, self.connection_id);
    }
}

fn discard_unclaimed(slot: &mut mpsc::Receiver<SseError>, connection_id: ConnectionId) {
    while let Ok(err) = slot.try_recv() {
        warn!(connection_id = %connection_id, error = %err, "sse write error");
    }
}
