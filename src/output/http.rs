//! Buffered HTTP sink (HEC-style endpoints).
//!
//! Payloads accumulate until `bufferBytes`, then the buffer is POSTed to a
//! randomly chosen endpoint with the configured headers. Certificate
//! verification is disabled: load targets routinely run self-signed.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::config::OutputConfig;
use crate::output::{pick_endpoint, Sink, SinkError};
use crate::pipeline::OutQueueItem;

#[derive(Default)]
pub struct HttpSink {
    client: Option<reqwest::Client>,
    buf: BytesMut,
    config: Option<OutputConfig>,
}

impl HttpSink {
    fn client(&mut self, cfg: &OutputConfig) -> Result<&reqwest::Client, SinkError> {
        if self.client.is_none() {
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(true)
                .timeout(Duration::from_secs(cfg.timeout))
                .build()
                .map_err(|e| SinkError::Http(e.to_string()))?;
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("client just initialized"))
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let Some(cfg) = self.config.clone() else {
            return Ok(());
        };
        let endpoint = pick_endpoint(&cfg.endpoints)?.to_string();
        let body = self.buf.split().freeze();
        let len = body.len();

        let mut request = self.client(&cfg)?.post(&endpoint).body(body);
        for (k, v) in &cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Http(format!("request to '{endpoint}' failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Http(format!(
                "endpoint '{endpoint}' returned {status}: {body}"
            )));
        }
        debug!(endpoint = %endpoint, bytes = len, "flushed HTTP buffer");
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&mut self, item: &OutQueueItem, payload: Bytes) -> Result<u64, SinkError> {
        self.config = Some(item.sample.output.clone());
        self.buf.extend_from_slice(&payload);
        if self.buf.len() > item.sample.output.buffer_bytes {
            self.flush().await?;
        }
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        self.flush().await
    }
}
