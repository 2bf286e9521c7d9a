//! Splunk-to-Splunk sinks: the cooked stream and the per-channel
//! universal-forwarder variant.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;

use crate::output::s2s::S2sClient;
use crate::output::{Sink, SinkError};
use crate::pipeline::OutQueueItem;
use crate::sample::Event;

/// Streams pre-framed S2S payloads over a buffered connection.
#[derive(Default)]
pub struct SplunkTcpSink {
    client: Option<S2sClient>,
}

#[async_trait]
impl Sink for SplunkTcpSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let cfg = &item.sample.output;
        if self.client.is_none() {
            self.client = Some(S2sClient::connect(&cfg.endpoints, cfg.buffer_bytes).await?);
        }
        self.client
            .as_mut()
            .expect("client just initialized")
            .write_payload(&payload)
            .await?;
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(client) = self.client.take() {
            client.close().await?;
        }
        Ok(())
    }
}

struct UfBuffer {
    /// Event metadata shared by every line on this channel.
    meta: Event,
    raw: String,
    events: u64,
}

/// Universal-forwarder emulation: raw lines accumulate per `_channel`; a
/// flush sends the combined raw payload followed by a `_done` sentinel event.
#[derive(Default)]
pub struct SplunkTcpUfSink {
    client: Option<S2sClient>,
    bufs: HashMap<String, UfBuffer>,
}

async fn flush_channel(client: &mut S2sClient, buf: &mut UfBuffer) -> Result<u64, SinkError> {
    buf.meta.insert("_raw".to_string(), std::mem::take(&mut buf.raw));
    let mut sent = client.send_event(&buf.meta).await?;

    buf.meta.insert("_raw".to_string(), String::new());
    buf.meta.insert("_done".to_string(), "_done".to_string());
    sent += client.send_event(&buf.meta).await?;

    buf.meta.remove("_raw");
    buf.meta.remove("_done");
    buf.events = 0;
    Ok(sent)
}

#[async_trait]
impl Sink for SplunkTcpUfSink {
    async fn send(&mut self, item: &OutQueueItem, _payload: Bytes) -> Result<u64, SinkError> {
        let cfg = &item.sample.output;
        if self.client.is_none() {
            self.client = Some(S2sClient::connect(&cfg.endpoints, cfg.buffer_bytes).await?);
        }
        let SplunkTcpUfSink { client, bufs } = self;
        let client = client.as_mut().expect("client just initialized");

        let mut sent = 0;
        for event in item.events.iter() {
            let channel = event
                .get("_channel")
                .ok_or_else(|| SinkError::MissingField("_channel".to_string()))?;
            let buf = bufs.entry(channel.clone()).or_insert_with(|| {
                let mut meta: Event = event.clone();
                meta.remove("_raw");
                UfBuffer {
                    meta,
                    raw: String::new(),
                    events: 0,
                }
            });
            if let Some(raw) = event.get("_raw") {
                buf.raw.push_str(raw);
                buf.raw.push('\n');
            }
            buf.events += 1;

            if buf.raw.len() > cfg.buffer_bytes {
                sent += flush_channel(client, buf).await?;
            }
        }
        Ok(sent)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        let SplunkTcpUfSink { client, bufs } = self;
        if let Some(client) = client.as_mut() {
            for buf in bufs.values_mut() {
                if !buf.raw.is_empty() {
                    flush_channel(client, buf).await?;
                }
            }
        }
        if let Some(client) = client.take() {
            client.close().await?;
        }
        Ok(())
    }
}
