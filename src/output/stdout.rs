//! The trivial sinks: stdout, devnull, and the in-memory capture buffer.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::output::{BufRegistry, Sink, SinkError};
use crate::pipeline::OutQueueItem;

#[derive(Default)]
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn send(&mut self, _item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Discards events without formatting them. Accounts the raw field plus the
/// newline each event would have serialized to.
pub struct DevNullSink;

#[async_trait]
impl Sink for DevNullSink {
    async fn send(&mut self, item: &OutQueueItem, _payload: Bytes) -> Result<u64, SinkError> {
        let bytes: u64 = item
            .events
            .iter()
            .map(|ev| ev.get("_raw").map_or(0, |raw| raw.len() as u64) + 1)
            .sum();
        Ok(bytes)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Captures payloads into the pipeline's shared buffer registry, keyed by
/// sample name. Used by tests and one-shot runs.
pub struct BufSink {
    buffers: BufRegistry,
}

impl BufSink {
    pub fn new(buffers: BufRegistry) -> Self {
        BufSink { buffers }
    }
}

#[async_trait]
impl Sink for BufSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let mut buffers = self.buffers.lock().unwrap_or_else(|p| p.into_inner());
        buffers
            .entry(item.sample.name.clone())
            .or_default()
            .extend_from_slice(&payload);
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}
