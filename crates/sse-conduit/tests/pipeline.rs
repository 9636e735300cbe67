//! End-to-end tests of the upgrade and the writer loop.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{wait_until_closed, BufferedSink, RecordingSink};
use http::{header, Request};
use http_body_util::BodyExt;
use sse_conduit::prelude::*;
use tokio_util::sync::CancellationToken;

const BOUND: Duration = Duration::from_secs(2);

async fn open(sink: &RecordingSink) -> (Connection, CancellationToken) {
    let disconnect = CancellationToken::new();
    let connection = upgrade_with_cancel(sink.clone(), disconnect.clone())
        .await
        .unwrap();
    (connection, disconnect)
}

#[tokio::test]
async fn upgrade_commits_headers_before_any_event() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    let headers = sink.committed_headers().unwrap();
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/event-stream");
    assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-cache");
    assert_eq!(headers.get(header::CONNECTION).unwrap(), "keep-alive");
    assert_eq!(sink.flushes(), 1);
    assert_eq!(sink.writes(), 0);
    assert!(connection.is_open());
}

#[tokio::test]
async fn upgrade_without_flush_support_is_rejected() {
    let request = Request::builder().uri("/events").body(()).unwrap();

    let result = upgrade(BufferedSink::default(), &request).await;

    assert!(matches!(result, Err(SseError::StreamingUnsupported)));
}

#[tokio::test]
async fn json_event_has_only_a_data_line() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    connection
        .send_json(&serde_json::json!({ "k": "v" }))
        .await
        .unwrap();
    connection.close();
    wait_until_closed(&connection).await;

    assert_eq!(sink.body(), "data: {\"k\":\"v\"}\n\n");
}

#[tokio::test]
async fn builder_event_writes_id_event_data_in_order() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    connection
        .build_message()
        .with_event("update")
        .with_id("42")
        .send_bytes(&b"payload"[..])
        .await
        .unwrap();
    connection.close();
    wait_until_closed(&connection).await;

    assert_eq!(sink.body(), "id: 42\nevent: update\ndata: payload\n\n");
    assert_eq!(sink.flushes(), 2);
}

#[tokio::test]
async fn unserializable_json_never_reaches_the_transport() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    let mut value = HashMap::new();
    value.insert(vec![1, 2], "non-string keys cannot become JSON object keys");

    let err = connection.send_json(&value).await.unwrap_err();
    assert!(matches!(err, SseError::SerializationFailed(_)));

    let err = connection
        .build_message()
        .with_id("7")
        .send_json(&value)
        .await
        .unwrap_err();
    assert!(matches!(err, SseError::SerializationFailed(_)));

    connection.close();
    wait_until_closed(&connection).await;
    assert_eq!(sink.writes(), 0);
}

#[tokio::test]
async fn sequential_sends_keep_their_order() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    for i in 0..50 {
        connection.send_string(format!("event {i}")).await.unwrap();
    }
    connection.close();
    wait_until_closed(&connection).await;

    let expected: String = (0..50).map(|i| format!("data: event {i}\n\n")).collect();
    assert_eq!(sink.body(), expected);
}

#[tokio::test]
async fn concurrent_producers_never_interleave_blocks() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    let producers: Vec<_> = (0..8)
        .map(|p| {
            let connection = connection.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    connection
                        .build_message()
                        .with_event(format!("producer-{p}"))
                        .send_string(format!("{p}:{i}"))
                        .await
                        .unwrap();
                }
            })
        })
        .collect();

    for producer in producers {
        producer.await.unwrap();
    }
    connection.close();
    wait_until_closed(&connection).await;

    let body = sink.body();
    let blocks: Vec<&str> = body.split_terminator("\n\n").collect();
    assert_eq!(blocks.len(), 8 * 25);

    let mut next = [0usize; 8];
    for block in blocks {
        let mut lines = block.lines();
        let event = lines.next().unwrap().strip_prefix("event: producer-").unwrap();
        let data = lines.next().unwrap().strip_prefix("data: ").unwrap();
        assert!(lines.next().is_none());

        let p: usize = event.parse().unwrap();
        assert_eq!(data, format!("{p}:{}", next[p]));
        next[p] += 1;
    }
}

#[tokio::test]
async fn sends_after_disconnect_fail_without_blocking() {
    let sink = RecordingSink::new();
    let (connection, disconnect) = open(&sink).await;

    disconnect.cancel();
    wait_until_closed(&connection).await;

    let attempts: Vec<_> = (0..16)
        .map(|i| {
            let connection = connection.clone();
            tokio::spawn(async move { connection.send_string(format!("late {i}")).await })
        })
        .collect();

    for attempt in attempts {
        let result = tokio::time::timeout(BOUND, attempt).await.unwrap().unwrap();
        assert!(matches!(result, Err(SseError::ConnectionClosed(_))));
    }
    assert_eq!(sink.writes(), 0);
}

#[tokio::test]
async fn disconnect_during_pending_send_does_not_hang() {
    let sink = RecordingSink::gated();
    let (connection, disconnect) = open(&sink).await;

    // The writer takes the first message and parks inside the gated write.
    connection.send_string("first").await.unwrap();

    let waiting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_string("second").await })
    };
    tokio::task::yield_now().await;

    // The gate is never opened: the disconnect alone frees the writer.
    disconnect.cancel();

    let result = tokio::time::timeout(BOUND, waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(SseError::ConnectionClosed(_))));

    wait_until_closed(&connection).await;
    assert!(!connection.is_open());
    assert_eq!(sink.writes(), 0);
}

#[tokio::test]
async fn close_stops_the_writer_and_rejects_later_sends() {
    let sink = RecordingSink::new();
    let (connection, _disconnect) = open(&sink).await;

    connection.send_string("before close").await.unwrap();
    connection.close();
    connection.close();
    wait_until_closed(&connection).await;

    let result = tokio::time::timeout(BOUND, connection.send_string("after close"))
        .await
        .unwrap();
    assert!(matches!(result, Err(SseError::ConnectionClosed(_))));
    assert_eq!(sink.body(), "data: before close\n\n");
}

#[tokio::test]
async fn close_releases_producers_waiting_for_handoff() {
    let sink = RecordingSink::gated();
    let (connection, _disconnect) = open(&sink).await;

    connection.send_string("in flight").await.unwrap();
    let waiting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.send_string("queued").await })
    };
    tokio::task::yield_now().await;

    connection.close();
    sink.release(1);

    let result = tokio::time::timeout(BOUND, waiting).await.unwrap().unwrap();
    assert!(matches!(result, Err(SseError::ConnectionClosed(_))));
    wait_until_closed(&connection).await;
    assert_eq!(sink.body(), "data: in flight\n\n");
}

#[tokio::test]
async fn send_timeout_drops_the_message() {
    let sink = RecordingSink::gated();
    let disconnect = CancellationToken::new();
    let config = SseConfig::new().with_send_timeout(Duration::from_millis(50));
    let connection = upgrade_with_config(sink.clone(), disconnect, config)
        .await
        .unwrap();

    connection.send_string("slow").await.unwrap();

    let err = connection.send_string("impatient").await.unwrap_err();
    assert!(matches!(err, SseError::SendTimeout(_)));
    assert!(err.is_recoverable());

    sink.release(2);
    connection.send_string("after").await.unwrap();
    connection.close();
    wait_until_closed(&connection).await;

    assert_eq!(sink.body(), "data: slow\n\ndata: after\n\n");
}

#[tokio::test]
async fn dropping_the_body_marks_the_connection_closed() {
    let disconnect = CancellationToken::new();
    let (sink, pending) = BodySink::new(disconnect.clone());
    let connection = upgrade_with_cancel(sink, disconnect).await.unwrap();

    let response = pending.into_response().await.unwrap();
    drop(response);

    wait_until_closed(&connection).await;
    let result = tokio::time::timeout(BOUND, connection.send_string("gone"))
        .await
        .unwrap();
    assert!(matches!(result, Err(SseError::ConnectionClosed(_))));
}

#[tokio::test]
async fn dropping_the_body_closes_a_request_upgrade() {
    let request = Request::builder().uri("/events").body(()).unwrap();
    let (sink, pending) = BodySink::new(CancellationToken::new());
    let connection = upgrade(sink, &request).await.unwrap();

    let response = pending.into_response().await.unwrap();
    drop(response);

    wait_until_closed(&connection).await;
    let result = tokio::time::timeout(BOUND, connection.send_string("gone"))
        .await
        .unwrap();
    assert!(matches!(result, Err(SseError::ConnectionClosed(_))));
}

#[tokio::test]
async fn hyper_body_streams_each_event_as_a_frame() {
    let disconnect = CancellationToken::new();
    let (sink, pending) = BodySink::new(disconnect.clone());
    let connection = upgrade_with_cancel(sink, disconnect).await.unwrap();
    let mut body = pending.into_response().await.unwrap().into_body();

    connection
        .build_message()
        .with_id("1")
        .send_string("one")
        .await
        .unwrap();
    let frame = body.frame().await.unwrap().unwrap();
    assert_eq!(frame.into_data().unwrap(), "id: 1\ndata: one\n\n");

    connection.send_string("two").await.unwrap();
    let frame = body.frame().await.unwrap().unwrap();
    assert_eq!(frame.into_data().unwrap(), "data: two\n\n");

    drop(connection);
    assert!(body.frame().await.is_none());
}

#[tokio::test]
async fn request_extension_drives_disconnect() {
    let token = CancellationToken::new();
    let mut request = Request::builder().uri("/events").body(()).unwrap();
    request.extensions_mut().insert(token.clone());

    let sink = RecordingSink::new();
    let connection = upgrade(sink, &request).await.unwrap();
    assert!(connection.is_open());

    token.cancel();
    wait_until_closed(&connection).await;
}
