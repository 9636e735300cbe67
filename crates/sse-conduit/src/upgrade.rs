//! Upgrading an HTTP response into an SSE stream.

use http::{header, HeaderMap, HeaderValue, Request};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::SseConfig;
use crate::connection::Connection;
use crate::error::{SseError, SseResult};
use crate::sink::ResponseSink;

/// Set the fixed SSE response headers.
///
/// - `Content-Type: text/event-stream`
/// - `Cache-Control: no-cache`
/// - `Connection: keep-alive`
pub fn set_sse_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
}

/// Get the cancellation signal of a request.
///
/// Servers signal a client disconnect or shutdown by cancelling a
/// [`CancellationToken`] stored in the request extensions. A request without
/// one gets a fresh token that nobody cancels.
pub fn request_cancellation<B>(request: &Request<B>) -> CancellationToken {
    request
        .extensions()
        .get::<CancellationToken>()
        .cloned()
        .unwrap_or_default()
}

/// Upgrade `sink` into an SSE stream for `request`.
///
/// The writer loop stops when the request's cancellation token fires (see
/// [`request_cancellation`]) or when the sink reports that the client went
/// away (see [`ResponseSink::disconnect`]).
pub async fn upgrade<S, B>(sink: S, request: &Request<B>) -> SseResult<Connection>
where
    S: ResponseSink,
{
    upgrade_with_cancel(sink, request_cancellation(request)).await
}

/// Upgrade `sink` into an SSE stream that stops when `disconnect` fires or
/// the sink reports a disconnect.
pub async fn upgrade_with_cancel<S>(sink: S, disconnect: CancellationToken) -> SseResult<Connection>
where
    S: ResponseSink,
{
    upgrade_with_config(sink, disconnect, SseConfig::default()).await
}

/// Upgrade `sink` into an SSE stream with explicit configuration.
///
/// Fails with [`SseError::StreamingUnsupported`] if the sink cannot flush,
/// and with [`SseError::Io`] if committing the headers fails. In both cases no
/// connection is created. On success the headers have been sent and the
/// writer loop is running on the current Tokio runtime.
#[instrument(skip_all)]
pub async fn upgrade_with_config<S>(
    mut sink: S,
    disconnect: CancellationToken,
    config: SseConfig,
) -> SseResult<Connection>
where
    S: ResponseSink,
{
    if !sink.supports_flush() {
        debug!("response sink cannot flush, refusing sse upgrade");
        return Err(SseError::StreamingUnsupported);
    }

    set_sse_headers(sink.headers_mut());
    sink.flush().await?;

    let (connection, writer) = Connection::open(sink, disconnect, &config);
    debug!(connection_id = %connection.id(), "upgraded response to sse");
    tokio::spawn(writer.run());

    Ok(connection)
}
