//! The per-connection writer loop.
//!
//! One loop owns the [`ResponseSink`] of a connection. Producers reach it only
//! through the message channel, so transport writes never race.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionId, Handoff};
use crate::error::SseError;
use crate::message::KEEP_ALIVE_COMMENT;
use crate::sink::ResponseSink;

/// Why a writer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    /// The request was cancelled: the client went away or the server is
    /// shutting down.
    Disconnected,
    /// [`Connection::close`](crate::Connection::close) was called.
    Closed,
    /// Every connection handle was dropped.
    Abandoned,
}

/// Non-blocking delivery of transport failures.
///
/// A failure goes to the error slot only while a task waits in
/// [`Connection::next_error`](crate::Connection::next_error); otherwise it is
/// logged.
#[derive(Debug)]
pub(crate) struct ErrorReporter {
    connection_id: ConnectionId,
    slot: mpsc::Sender<SseError>,
    waiters: Arc<AtomicUsize>,
}

impl ErrorReporter {
    pub(crate) fn new(
        connection_id: ConnectionId,
        slot: mpsc::Sender<SseError>,
        waiters: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            connection_id,
            slot,
            waiters,
        }
    }

    pub(crate) fn report(&self, err: SseError) {
        let err = if self.waiters.load(Ordering::Acquire) > 0 {
            match self.slot.try_send(err) {
                Ok(()) => return,
                Err(TrySendError::Full(err) | TrySendError::Closed(err)) => err,
            }
        } else {
            err
        };

        warn!(connection_id = %self.connection_id, error = %err, "sse write error");
    }
}

enum Wake {
    Disconnected,
    Shutdown,
    Message(Option<Handoff>),
    KeepAlive,
}

pub(crate) struct WriterLoop<S> {
    connection_id: ConnectionId,
    sink: S,
    messages: mpsc::Receiver<Handoff>,
    shutdown: CancellationToken,
    disconnect: CancellationToken,
    client_gone: CancellationToken,
    open: Arc<AtomicBool>,
    errors: ErrorReporter,
    keep_alive: Option<Duration>,
}

impl<S: ResponseSink> WriterLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection_id: ConnectionId,
        sink: S,
        messages: mpsc::Receiver<Handoff>,
        shutdown: CancellationToken,
        disconnect: CancellationToken,
        open: Arc<AtomicBool>,
        errors: ErrorReporter,
        keep_alive: Option<Duration>,
    ) -> Self {
        let client_gone = sink.disconnect().unwrap_or_default();

        Self {
            connection_id,
            sink,
            messages,
            shutdown,
            disconnect,
            client_gone,
            open,
            errors,
            keep_alive,
        }
    }

    /// Run until disconnect, close, or abandonment.
    ///
    /// The disconnect signals (the upgrade's token and the sink's own) are
    /// checked first on every iteration and end the loop regardless of queued
    /// messages. They also interrupt a write stuck on a slow client.
    pub(crate) async fn run(mut self) -> StopReason {
        debug!(connection_id = %self.connection_id, "sse writer started");

        let mut keep_alive = self.keep_alive.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let reason = loop {
            let wake = tokio::select! {
                biased;
                () = self.disconnect.cancelled() => Wake::Disconnected,
                () = self.client_gone.cancelled() => Wake::Disconnected,
                () = self.shutdown.cancelled() => Wake::Shutdown,
                handoff = self.messages.recv() => Wake::Message(handoff),
                () = tick(keep_alive.as_mut()) => Wake::KeepAlive,
            };

            let interrupted = match wake {
                Wake::Disconnected => break StopReason::Disconnected,
                Wake::Shutdown => break StopReason::Closed,
                Wake::Message(None) => break StopReason::Abandoned,
                Wake::Message(Some(handoff)) => self.accept(handoff).await,
                Wake::KeepAlive => {
                    self.write_block(Bytes::from_static(KEEP_ALIVE_COMMENT))
                        .await
                }
            };

            if let Some(reason) = interrupted {
                break reason;
            }
        };

        self.stop(reason)
    }

    async fn accept(&mut self, handoff: Handoff) -> Option<StopReason> {
        let Handoff { message, accepted } = handoff;

        if accepted.send(()).is_err() {
            trace!(connection_id = %self.connection_id, "producer gave up, dropping message");
            return None;
        }

        self.write_block(message.to_bytes()).await
    }

    /// Write and flush one block, giving up if the client disconnects first.
    async fn write_block(&mut self, block: Bytes) -> Option<StopReason> {
        trace!(connection_id = %self.connection_id, len = block.len(), "writing event block");

        tokio::select! {
            biased;
            () = self.disconnect.cancelled() => Some(StopReason::Disconnected),
            () = self.client_gone.cancelled() => Some(StopReason::Disconnected),
            () = deliver(&mut self.sink, &self.errors, block) => None,
        }
    }

    fn stop(mut self, reason: StopReason) -> StopReason {
        self.open.store(false, Ordering::Release);

        // Releasing queued handoffs wakes their producers with ConnectionClosed.
        self.messages.close();
        while self.messages.try_recv().is_ok() {}

        debug!(connection_id = %self.connection_id, reason = ?reason, "sse writer stopped");
        reason
    }
}

#[cfg(test)]
impl<S> WriterLoop<S> {
    pub(crate) fn take_next_handoff(&mut self) -> Option<Handoff> {
        self.messages.try_recv().ok()
    }

    pub(crate) fn report_error(&self, err: SseError) {
        self.errors.report(err);
    }
}

async fn deliver<S: ResponseSink>(sink: &mut S, errors: &ErrorReporter, block: Bytes) {
    if let Err(e) = sink.write(block).await {
        errors.report(SseError::write_failed(e.to_string()));
    }

    if let Err(e) = sink.flush().await {
        errors.report(SseError::write_failed(e.to_string()));
    }
}

async fn tick(keep_alive: Option<&mut Interval>) {
    match keep_alive {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
