//! Kafka producer sink.
//!
//! Each newline-delimited payload line is produced as one record to the
//! configured topic.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use crate::output::{Sink, SinkError};
use crate::pipeline::OutQueueItem;

#[derive(Default)]
pub struct KafkaSink {
    producer: Option<FutureProducer>,
    timeout: Duration,
}

#[async_trait]
impl Sink for KafkaSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        let cfg = &item.sample.output;
        if self.producer.is_none() {
            if cfg.endpoints.is_empty() {
                return Err(SinkError::NoEndpoints);
            }
            self.timeout = Duration::from_secs(cfg.timeout.max(1));
            let producer = ClientConfig::new()
                .set("bootstrap.servers", cfg.endpoints.join(","))
                .set("message.timeout.ms", (self.timeout.as_millis()).to_string())
                .create()
                .map_err(|e| SinkError::Kafka(e.to_string()))?;
            self.producer = Some(producer);
        }
        let producer = self.producer.as_ref().expect("producer just initialized");

        for line in payload.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            let record = FutureRecord::<(), [u8]>::to(&cfg.topic).payload(line);
            producer
                .send(record, Timeout::After(self.timeout))
                .await
                .map_err(|(e, _)| SinkError::Kafka(e.to_string()))?;
        }
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(producer) = self.producer.take() {
            producer
                .flush(Timeout::After(self.timeout))
                .map_err(|e| SinkError::Kafka(e.to_string()))?;
        }
        Ok(())
    }
}
