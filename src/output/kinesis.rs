//! AWS Kinesis sink.
//!
//! Events accumulate as `PutRecordsRequestEntry` values (partition key from
//! the event's `host`, data from `_raw`) and flush in batches of up to 500.
//! Entries a flush reports as failed are re-prepended so the next flush
//! retries them.

use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use aws_sdk_kinesis::Client;
use bytes::Bytes;
use tracing::debug;

use crate::output::{Sink, SinkError};
use crate::pipeline::OutQueueItem;

const BATCH_SIZE: usize = 500;

#[derive(Default)]
pub struct KinesisSink {
    client: Option<Client>,
    buf: Vec<PutRecordsRequestEntry>,
    stream_name: String,
}

impl KinesisSink {
    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let batch: Vec<PutRecordsRequestEntry> = if self.buf.len() > BATCH_SIZE {
            self.buf.drain(..BATCH_SIZE).collect()
        } else {
            std::mem::take(&mut self.buf)
        };
        let client = self.client.as_ref().expect("client initialized before flush");

        let response = client
            .put_records()
            .stream_name(&self.stream_name)
            .set_records(Some(batch.clone()))
            .send()
            .await
            .map_err(|e| SinkError::Kinesis(e.to_string()))?;

        let failed: Vec<PutRecordsRequestEntry> = response
            .records()
            .iter()
            .zip(batch)
            .filter(|(result, _)| result.error_code().is_some())
            .map(|(_, entry)| entry)
            .collect();
        if !failed.is_empty() {
            debug!(failed = failed.len(), "re-queueing failed kinesis records");
            self.buf.splice(0..0, failed);
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for KinesisSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let cfg = &item.sample.output;
        if self.client.is_none() {
            let aws_config =
                aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            self.client = Some(Client::new(&aws_config));
            self.stream_name = cfg.topic.clone();
        }

        for event in item.events.iter() {
            let partition_key = event.get("host").cloned().unwrap_or_default();
            let data = event.get("_raw").cloned().unwrap_or_default();
            let entry = PutRecordsRequestEntry::builder()
                .partition_key(partition_key)
                .data(Blob::new(data.into_bytes()))
                .build()
                .map_err(|e| SinkError::Kinesis(e.to_string()))?;
            self.buf.push(entry);
        }

        if self.buf.len() >= BATCH_SIZE {
            self.flush().await?;
        }
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        while !self.buf.is_empty() && self.client.is_some() {
            let before = self.buf.len();
            self.flush().await?;
            // Records failing permanently would spin here forever.
            if self.buf.len() >= before {
                break;
            }
        }
        Ok(())
    }
}
