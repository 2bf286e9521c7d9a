//! Sinks: pluggable delivery backends for formatted event payloads.
//!
//! A sink receives the serialized payload of one output-queue item and ships
//! it. Sinks hold their connections across items; the output worker discards
//! a failing sink so the next item reinitializes it. Delivery is lossy by
//! design: a sink error drops the payload.

pub mod file;
pub mod format;
pub mod http;
pub mod kafka;
pub mod kinesis;
pub mod network;
pub mod s2s;
pub mod splunktcp;
pub mod stdout;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::pipeline::OutQueueItem;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("kafka error: {0}")]
    Kafka(String),

    #[error("kinesis error: {0}")]
    Kinesis(String),

    #[error("missing field '{0}' in event")]
    MissingField(String),
}

/// A delivery backend.
///
/// `send` blocks until the payload is accepted (written, buffered, or
/// produced) and returns the number of bytes accounted to the sample.
/// `close` is idempotent and flushes whatever the sink buffered.
#[async_trait]
pub trait Sink: Send {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError>;

    async fn close(&mut self) -> Result<(), SinkError>;
}

/// Shared capture buffers for the `buf` sink, keyed by sample name. Owned by
/// the pipeline and handed to tests and one-shot runs.
pub type BufRegistry = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Construct a sink by outputter name. Unknown names fall back to stdout.
pub fn build_sink(name: &str, buffers: &BufRegistry) -> Box<dyn Sink> {
    match name {
        "stdout" => Box::new(stdout::StdoutSink::default()),
        "devnull" => Box::new(stdout::DevNullSink),
        "buf" => Box::new(stdout::BufSink::new(buffers.clone())),
        "file" => Box::new(file::FileSink::default()),
        "http" => Box::new(http::HttpSink::default()),
        "network" => Box::new(network::NetworkSink::default()),
        "kafka" => Box::new(kafka::KafkaSink::default()),
        "kinesis" => Box::new(kinesis::KinesisSink::default()),
        "splunktcp" => Box::new(splunktcp::SplunkTcpSink::default()),
        "splunktcpuf" => Box::new(splunktcp::SplunkTcpUfSink::default()),
        other => {
            tracing::error!(outputter = other, "unknown outputter, using stdout");
            Box::new(stdout::StdoutSink::default())
        }
    }
}

/// Pick a random endpoint from the configured list.
pub(crate) fn pick_endpoint(endpoints: &[String]) -> Result<&str, SinkError> {
    use rand::Rng;
    if endpoints.is_empty() {
        return Err(SinkError::NoEndpoints);
    }
    let idx = rand::thread_rng().gen_range(0..endpoints.len());
    Ok(&endpoints[idx])
}
