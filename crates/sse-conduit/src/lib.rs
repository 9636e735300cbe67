//! # sse-conduit
//!
//! Upgrade a long-lived HTTP response into a Server-Sent Events stream and
//! push events to it from any number of tasks.
//!
//! Each upgraded response gets exactly one writer task. Producers hand
//! messages to it through a [`Connection`], and the writer serializes them,
//! writes them to the [`ResponseSink`] and flushes after every event. The
//! writer stops when the request is cancelled (client gone or server shutting
//! down), when [`Connection::close`] is called, or when every handle has been
//! dropped.
//!
//! ## Features
//!
//! - **Single writer**: transport writes never race, no locks around the sink
//! - **Ordered handoff**: a send returns only once the writer has taken the
//!   message, so one producer's events arrive in call order
//! - **Fluent builder**: optional `id` and `event` fields, bytes, strings or
//!   JSON payloads
//! - **Hyper integration**: [`BodySink`] streams into a hyper response body
//!   and turns a dropped body into a disconnect
//!
//! ## Example
//!
//! ```rust,no_run
//! use sse_conduit::{upgrade_with_cancel, BodySink, SseResponse, SseResult};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn events() -> SseResult<SseResponse> {
//!     let disconnect = CancellationToken::new();
//!     let (sink, pending) = BodySink::new(disconnect.clone());
//!     let connection = upgrade_with_cancel(sink, disconnect).await?;
//!
//!     tokio::spawn(async move {
//!         let mut counter = 0u64;
//!         while connection.is_open() {
//!             counter += 1;
//!             let sent = connection
//!                 .build_message()
//!                 .with_id(counter.to_string())
//!                 .with_event("tick")
//!                 .send_json(&serde_json::json!({ "counter": counter }))
//!                 .await;
//!             if sent.is_err() {
//!                 break;
//!             }
//!             tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!         }
//!     });
//!
//!     pending.into_response().await
//! }
//! ```
//!
//! ## Wire format
//!
//! ```text
//! id: 1
//! event: tick
//! data: {"counter":1}
//!
//! ```
//!
//! `id` and `event` lines are omitted when empty. Data containing newlines is
//! written as several `data:` lines.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod connection;
mod error;
mod message;
mod sink;
mod upgrade;
mod writer;

pub use config::{SseConfig, SseConfigBuilder, DEFAULT_BODY_BUFFER};
pub use connection::{Connection, ConnectionId};
pub use error::{SseError, SseResult};
pub use message::{Message, MessageBuilder};
pub use sink::{BodySink, PendingResponse, ResponseSink, SseBody, SseResponse};
pub use upgrade::{
    request_cancellation, set_sse_headers, upgrade, upgrade_with_cancel, upgrade_with_config,
};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::SseConfig;
    pub use crate::connection::Connection;
    pub use crate::error::{SseError, SseResult};
    pub use crate::message::Message;
    pub use crate::sink::{BodySink, ResponseSink};
    pub use crate::upgrade::{upgrade, upgrade_with_cancel, upgrade_with_config};
}
