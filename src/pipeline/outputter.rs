//! Output workers.
//!
//! A worker serializes each output-queue item with the sample's wire format
//! and hands the payload to its sink. The formatted payload is cached
//! alongside the generation cache so a `useCache` cohort skips both
//! generation and formatting. Sink errors degrade: the sink is discarded for
//! reinitialization and failures are logged at most once per ROT interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::output::format::{self, TemplateSet};
use crate::output::{build_sink, BufRegistry, Sink};
use crate::pipeline::{Caches, OutQueueItem};
use crate::pipeline::stats::StatsHandle;

/// Rate-limits sink error logging: the first failure logs immediately,
/// repeats within the window only count, and the first failure after the
/// window re-logs with the accumulated count.
pub struct ErrorTracker {
    window: Duration,
    since: Option<Instant>,
    count: u64,
}

impl ErrorTracker {
    pub fn new(window_secs: u64) -> Self {
        ErrorTracker {
            window: Duration::from_secs(window_secs.max(1)),
            since: None,
            count: 0,
        }
    }

    /// Record a failure at `now`; returns the accumulated count when this
    /// failure should be logged.
    pub fn observe(&mut self, now: Instant) -> Option<u64> {
        self.count += 1;
        match self.since {
            None => {
                self.since = Some(now);
                Some(self.count)
            }
            Some(since) if now.duration_since(since) > self.window => {
                self.since = Some(now);
                let count = self.count;
                self.count = 0;
                Some(count)
            }
            Some(_) => None,
        }
    }
}

/// Worker loop: runs until the output queue closes and drains, then closes
/// its sink.
pub async fn run_worker(
    id: usize,
    out_rx: async_channel::Receiver<OutQueueItem>,
    caches: Arc<Caches>,
    stats: StatsHandle,
    templates: Arc<TemplateSet>,
    buffers: BufRegistry,
    rot_interval: u64,
) {
    let mut sink: Option<Box<dyn Sink>> = None;
    let mut errors = ErrorTracker::new(rot_interval);
    let mut last_sample: Option<String> = None;

    while let Ok(item) = out_rx.recv().await {
        if item.events.is_empty() {
            continue;
        }
        let outputter = item.sample.output.outputter.clone();
        if sink.is_none() {
            info!(sample = %item.sample.name, outputter = %outputter, "initializing sink");
            sink = Some(build_sink(&outputter, &buffers));
        }

        // devnull skips formatting entirely; the forwarder sink consumes
        // events rather than a serialized payload.
        let skip_render = outputter == "devnull" || outputter == "splunktcpuf";
        let payload = if skip_render {
            Bytes::new()
        } else {
            match render_cached(&item, &caches, &templates).await {
                Ok(payload) => payload,
                Err(e) => {
                    error!(sample = %item.sample.name, error = %e, "cannot format events, dropping item");
                    continue;
                }
            }
        };

        let send_result = sink
            .as_mut()
            .expect("sink initialized above")
            .send(&item, payload.clone())
            .await;

        // Events are accounted whether or not the sink accepted them; the
        // pipeline is lossy and the stats reflect generation volume.
        let bytes = match &send_result {
            Ok(bytes) => *bytes,
            Err(_) => payload.len() as u64,
        };
        stats.account(item.events.len() as u64, bytes, &item.sample.name);

        if let Err(e) = send_result {
            // Discard the sink so the next item reconnects.
            if let Some(mut failed) = sink.take() {
                let _ = failed.close().await;
            }
            if let Some(count) = errors.observe(Instant::now()) {
                error!(
                    sample = %item.sample.name,
                    error = %e,
                    errors = count,
                    window_secs = rot_interval,
                    "sink send failed"
                );
            }
        }
        last_sample = Some(item.sample.name.clone());
    }

    if let Some(mut sink) = sink {
        if let Some(name) = &last_sample {
            info!(sample = %name, "closing output");
        }
        if let Err(e) = sink.close().await {
            error!(error = %e, "error closing sink");
        }
    }
    debug!(worker = id, "output worker finished");
}

/// Serialize the item's events, replaying the cached payload for `useCache`
/// cohorts and capturing it on `setCache`.
async fn render_cached(
    item: &OutQueueItem,
    caches: &Caches,
    templates: &TemplateSet,
) -> Result<Bytes, format::FormatError> {
    if item.cache.use_cache {
        if let Some(payload) = caches.output.read().await.get(&item.sample.name) {
            return Ok(payload.clone());
        }
    }
    let payload = format::render_payload(&item.sample, &item.events, templates)?;
    if item.cache.set_cache {
        caches
            .output
            .write()
            .await
            .insert(item.sample.name.clone(), payload.clone());
    }
    Ok(payload)
}
