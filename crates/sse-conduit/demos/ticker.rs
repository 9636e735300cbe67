//! Minimal hyper server pushing a counter over SSE.
//!
//! ```text
//! cargo run -p sse-conduit --example ticker
//! curl -N http://127.0.0.1:3000/events
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use http::{Request, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use sse_conduit::{upgrade, BodySink, Connection};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Body = UnsyncBoxBody<Bytes, Infallible>;

fn plain(status: StatusCode, text: &'static str) -> Response<Body> {
    let body = Full::new(Bytes::from_static(text.as_bytes())).boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn handle(
    request: Request<Incoming>,
    shutdown: CancellationToken,
) -> Result<Response<Body>, Infallible> {
    if request.uri().path() != "/events" {
        return Ok(plain(StatusCode::NOT_FOUND, "try /events\n"));
    }

    // Cancelled when the client goes away or the server shuts down.
    let (sink, pending) = BodySink::new(shutdown.child_token());

    let connection = match upgrade(sink, &request).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!(error = %e, "sse upgrade failed");
            return Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "upgrade failed\n"));
        }
    };

    let watcher = connection.clone();
    tokio::spawn(async move {
        while let Some(err) = watcher.next_error().await {
            warn!(connection_id = %watcher.id(), error = %err, "event not delivered");
        }
    });
    tokio::spawn(tick(connection));

    match pending.into_response().await {
        Ok(response) => Ok(response.map(|body| body.boxed_unsync())),
        Err(e) => {
            warn!(error = %e, "sse response never committed");
            Ok(plain(StatusCode::INTERNAL_SERVER_ERROR, "stream failed\n"))
        }
    }
}

async fn tick(connection: Connection) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));

    for counter in 1u64.. {
        interval.tick().await;

        let sent = connection
            .build_message()
            .with_id(counter.to_string())
            .with_event("tick")
            .send_json(&serde_json::json!({ "counter": counter }))
            .await;

        if let Err(e) = sent {
            info!(connection_id = %connection.id(), error = %e, "ticker stopped");
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sse_conduit=debug")),
        )
        .init();

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    let listener = TcpListener::bind(addr).await?;
    let shutdown = CancellationToken::new();
    info!(%addr, "listening");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                shutdown.cancel();
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |request| handle(request, shutdown.clone()));
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        warn!(%peer, error = %e, "connection error");
                    }
                });
            }
        }
    }

    Ok(())
}
