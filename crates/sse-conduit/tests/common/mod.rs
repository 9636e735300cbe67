//! Shared test sinks.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::HeaderMap;
use sse_conduit::ResponseSink;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct Recorded {
    committed: Option<HeaderMap>,
    body: Vec<u8>,
    writes: usize,
    flushes: usize,
}

/// In-memory sink that records everything the writer loop does.
///
/// A gated sink holds every write until [`RecordingSink::release`] hands out
/// a permit, which lets tests park the writer loop mid-write.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    headers: HeaderMap,
    recorded: Arc<Mutex<Recorded>>,
    gate: Option<Arc<Semaphore>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    /// Let `writes` more writes through a gated sink.
    pub fn release(&self, writes: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(writes);
        }
    }

    pub fn body(&self) -> String {
        String::from_utf8(self.recorded.lock().unwrap().body.clone()).unwrap()
    }

    pub fn writes(&self) -> usize {
        self.recorded.lock().unwrap().writes
    }

    pub fn flushes(&self) -> usize {
        self.recorded.lock().unwrap().flushes
    }

    pub fn committed_headers(&self) -> Option<HeaderMap> {
        self.recorded.lock().unwrap().committed.clone()
    }
}

impl ResponseSink for RecordingSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    async fn write(&mut self, buf: Bytes) -> io::Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "gate closed"))?
                .forget();
        }

        let mut recorded = self.recorded.lock().unwrap();
        recorded.body.extend_from_slice(&buf);
        recorded.writes += 1;
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        let mut recorded = self.recorded.lock().unwrap();
        if recorded.committed.is_none() {
            recorded.committed = Some(self.headers.clone());
        }
        recorded.flushes += 1;
        Ok(())
    }
}

/// Sink without incremental flush support.
#[derive(Debug, Default)]
pub struct BufferedSink {
    headers: HeaderMap,
}

impl ResponseSink for BufferedSink {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn supports_flush(&self) -> bool {
        false
    }

    async fn write(&mut self, _buf: Bytes) -> io::Result<()> {
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wait for the writer loop to publish that it has stopped.
pub async fn wait_until_closed(connection: &sse_conduit::Connection) {
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while connection.is_open() {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("writer loop did not stop");
}
