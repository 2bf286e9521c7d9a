//! Throughput accounting.
//!
//! Output workers publish per-item counts over a channel; a dedicated
//! aggregation task owns the counters; a periodic read-out task logs
//! events/sec, kB/sec, and GB/day deltas. After the pipeline drains,
//! [`Stats::read_final`] waits for the aggregator to consume every pending
//! record so final totals are exact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

/// One accounting record from an output worker.
#[derive(Debug)]
pub struct OutputStats {
    pub events_written: u64,
    pub bytes_written: u64,
    pub sample_name: String,
}

/// Cloneable publishing side of the stats channel.
#[derive(Clone)]
pub struct StatsHandle {
    tx: async_channel::Sender<OutputStats>,
}

impl StatsHandle {
    pub fn account(&self, events_written: u64, bytes_written: u64, sample_name: &str) {
        // Unbounded channel: try_send only fails after shutdown.
        let _ = self.tx.try_send(OutputStats {
            events_written,
            bytes_written,
            sample_name: sample_name.to_string(),
        });
    }
}

#[derive(Default)]
struct Totals {
    events: HashMap<String, u64>,
    bytes: HashMap<String, u64>,
}

/// The stats subsystem: aggregator task + periodic read-out task.
pub struct Stats {
    handle: StatsHandle,
    totals: Arc<RwLock<Totals>>,
    aggregator: JoinHandle<()>,
    rot: JoinHandle<()>,
}

impl Stats {
    /// Spawn the aggregation and read-out tasks.
    pub fn start(rot_interval: u64) -> Self {
        let (tx, rx) = async_channel::unbounded::<OutputStats>();
        let totals = Arc::new(RwLock::new(Totals::default()));

        let agg_totals = totals.clone();
        let aggregator = tokio::spawn(async move {
            while let Ok(record) = rx.recv().await {
                let mut totals = agg_totals.write().await;
                *totals.events.entry(record.sample_name.clone()).or_default() +=
                    record.events_written;
                *totals.bytes.entry(record.sample_name).or_default() += record.bytes_written;
            }
        });

        let rot_totals = totals.clone();
        let interval = rot_interval.max(1);
        let rot = tokio::spawn(async move {
            let mut last_events: u64 = 0;
            let mut last_bytes: u64 = 0;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let (events, bytes) = {
                    let totals = rot_totals.read().await;
                    (
                        totals.events.values().sum::<u64>(),
                        totals.bytes.values().sum::<u64>(),
                    )
                };
                let events_sec = (events - last_events) as f64 / interval as f64;
                let kbytes_sec = (bytes - last_bytes) as f64 / interval as f64 / 1024.0;
                let gb_day = kbytes_sec * 60.0 * 60.0 * 24.0 / 1024.0 / 1024.0;
                info!(
                    events_sec = format_args!("{events_sec:.2}"),
                    kbytes_sec = format_args!("{kbytes_sec:.2}"),
                    gb_day = format_args!("{gb_day:.2}"),
                    "throughput"
                );
                last_events = events;
                last_bytes = bytes;
            }
        });

        Stats {
            handle: StatsHandle { tx },
            totals,
            aggregator,
            rot,
        }
    }

    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    /// Wait for every pending record to be aggregated, stop the read-out
    /// task, and return `(total events, total bytes)`.
    ///
    /// Call only after all publishing handles are dropped; otherwise the
    /// aggregator never observes channel closure.
    pub async fn read_final(self) -> (u64, u64) {
        drop(self.handle);
        let _ = self.aggregator.await;
        self.rot.abort();

        let totals = self.totals.read().await;
        let total_events: u64 = totals.events.values().sum();
        let total_bytes: u64 = totals.bytes.values().sum();
        info!(total_events, "total events written");
        info!(total_bytes, "total bytes written");
        info!(
            total_gbytes = format_args!("{:.2}", total_bytes as f64 / 1024.0 / 1024.0 / 1024.0),
            "total gigabytes written"
        );
        (total_events, total_bytes)
    }
}
