//! Response sinks the writer loop streams into.
//!
//! [`ResponseSink`] is the transport contract: header access, incremental
//! writes and an explicit flush. [`BodySink`] implements it on top of a
//! channel-backed [`SseBody`] that hyper can serve as a response body.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use http::{HeaderMap, Response};
use http_body_util::StreamBody;
use hyper::body::Frame;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{SseConfig, DEFAULT_BODY_BUFFER};
use crate::error::{SseError, SseResult};

/// An HTTP response that can be written and flushed incrementally.
///
/// Only the writer loop of a connection touches its sink once the upgrade
/// has completed.
pub trait ResponseSink: Send + 'static {
    /// Response headers. Changes after the first flush are not sent.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Whether [`flush`](Self::flush) actually pushes bytes to the client.
    ///
    /// Upgrading a sink that returns `false` fails with
    /// [`SseError::StreamingUnsupported`].
    fn supports_flush(&self) -> bool {
        true
    }

    /// Append bytes to the response body.
    fn write(&mut self, buf: Bytes) -> impl Future<Output = io::Result<()>> + Send;

    /// Push everything written so far to the client, committing the headers
    /// on first use.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Cancelled when the transport learns that the client went away.
    ///
    /// The writer loop stops on this signal as well as on the token given to
    /// the upgrade. Sinks that cannot observe the client return `None`.
    fn disconnect(&self) -> Option<CancellationToken> {
        None
    }
}

/// The HTTP response type produced by [`PendingResponse`].
pub type SseResponse = Response<StreamBody<SseBody>>;

fn broken_pipe(reason: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, reason)
}

/// A [`ResponseSink`] feeding a hyper response body.
///
/// Bytes are buffered until [`flush`](ResponseSink::flush), which sends them
/// to the paired [`SseBody`] as one data frame. The first flush also releases
/// the response head to the paired [`PendingResponse`].
#[derive(Debug)]
pub struct BodySink {
    headers: HeaderMap,
    head: Option<oneshot::Sender<HeaderMap>>,
    buffer: BytesMut,
    frames: mpsc::Sender<Bytes>,
    disconnect: CancellationToken,
}

impl BodySink {
    /// Create a sink and its pending response.
    ///
    /// `disconnect` is cancelled when the response body is dropped, which is
    /// how hyper reports a client that went away. The sink hands the token to
    /// the writer loop itself, so any of the upgrade functions will stop on
    /// it.
    pub fn new(disconnect: CancellationToken) -> (Self, PendingResponse) {
        Self::with_buffer(disconnect, DEFAULT_BODY_BUFFER)
    }

    /// Create a sink using the body buffer from `config`.
    pub fn with_config(disconnect: CancellationToken, config: &SseConfig) -> (Self, PendingResponse) {
        Self::with_buffer(disconnect, config.body_buffer)
    }

    fn with_buffer(disconnect: CancellationToken, frames: usize) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (frames_tx, frames_rx) = mpsc::channel(frames.max(1));

        let sink = Self {
            headers: HeaderMap::new(),
            head: Some(head_tx),
            buffer: BytesMut::new(),
            frames: frames_tx,
            disconnect: disconnect.clone(),
        };

        let pending = PendingResponse {
            head: head_rx,
            body: SseBody {
                frames: frames_rx,
                _disconnect: disconnect.drop_guard(),
            },
        };

        (sink, pending)
    }
}

impl ResponseSink for BodySink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write(&mut self, buf: Bytes) -> io::Result<()> {
        if self.frames.is_closed() {
            return Err(broken_pipe("response body dropped"));
        }
        self.buffer.extend_from_slice(&buf);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if let Some(head) = self.head.take() {
            head.send(self.headers.clone())
                .map_err(|_| broken_pipe("pending response dropped before headers were sent"))?;
        }

        if self.buffer.is_empty() {
            return Ok(());
        }

        let chunk = self.buffer.split().freeze();
        self.frames
            .send(chunk)
            .await
            .map_err(|_| broken_pipe("response body dropped"))
    }

    fn disconnect(&self) -> Option<CancellationToken> {
        Some(self.disconnect.clone())
    }
}

/// The response half of a [`BodySink`], waiting for the upgrade to commit
/// its headers.
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<HeaderMap>,
    body: SseBody,
}

impl PendingResponse {
    /// Wait for the headers and build the streaming response.
    ///
    /// Fails with [`SseError::ConnectionClosed`] if the sink was dropped
    /// without ever being flushed, e.g. because the upgrade was rejected.
    pub async fn into_response(self) -> SseResult<SseResponse> {
        let headers = self
            .head
            .await
            .map_err(|_| SseError::connection_closed("response headers were never committed"))?;

        let mut response = Response::new(StreamBody::new(self.body));
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Streaming response body fed by a [`BodySink`].
///
/// The stream ends once the writer loop has stopped. Dropping the body
/// cancels the disconnect token it was created with.
#[derive(Debug)]
pub struct SseBody {
    frames: mpsc::Receiver<Bytes>,
    _disconnect: DropGuard,
}

impl Stream for SseBody {
    type Item = Result<Frame<Bytes>, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames
            .poll_recv(cx)
            .map(|chunk| chunk.map(|bytes| Ok(Frame::data(bytes))))
    }
}
