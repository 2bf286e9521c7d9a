//! Per-sample scheduler.
//!
//! One timer runs per sample and decides when, and for how many events, work
//! enters the generator queue. Three regimes:
//!
//! * **backfill** — catch up from `begin` toward `end` (or now) without
//!   sleeping;
//! * **realtime** — sleep one interval per tick, indefinitely, until closed;
//! * **replay** — one line per tick, sleeping the line's original
//!   inter-arrival offset.
//!
//! The timer also drives the generation-cache cohort counter: one `SET` tick
//! followed by `cacheIntervals` `USE` ticks, repeating.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::pipeline::{CacheFlags, GenQueueItem, OutQueueItem};
use crate::rater;
use crate::sample::{Generator, Sample};
use crate::script::ScriptHost;

/// Close control for a running timer. Closing is idempotent and sticky; the
/// timer observes it at interval boundaries and inside the enqueue retry
/// loop. Closing never drains queues, it only stops scheduling.
#[derive(Clone)]
pub struct TimerHandle {
    name: String,
    closed: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn close(&self) {
        info!(sample = %self.name, "closing timer");
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Timer {
    sample: Arc<Sample>,
    gen_tx: async_channel::Sender<GenQueueItem>,
    out_tx: async_channel::Sender<OutQueueItem>,
    closed: Arc<AtomicBool>,
    cache_intervals: u32,
    cache_counter: i64,
    /// Replay line cursor.
    cur: usize,
    /// Backfill cursor; advances monotonically while the timer runs.
    current: DateTime<Utc>,
    realtime: bool,
    rng: StdRng,
    host: Arc<dyn ScriptHost>,
}

impl Timer {
    pub fn new(
        sample: Arc<Sample>,
        gen_tx: async_channel::Sender<GenQueueItem>,
        out_tx: async_channel::Sender<OutQueueItem>,
        cache_intervals: u32,
        host: Arc<dyn ScriptHost>,
    ) -> (Self, TimerHandle) {
        let closed = Arc::new(AtomicBool::new(false));
        let handle = TimerHandle {
            name: sample.name.clone(),
            closed: closed.clone(),
        };
        let current = sample.begin.unwrap_or_else(Utc::now);
        let realtime = sample.realtime;
        let timer = Timer {
            sample,
            gen_tx,
            out_tx,
            closed,
            cache_intervals,
            cache_counter: 0,
            cur: 0,
            current,
            realtime,
            rng: StdRng::from_entropy(),
            host,
        };
        (timer, handle)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run until the bounded window is exhausted or the handle closes.
    pub async fn run(mut self) {
        if !self.realtime {
            let n = Utc::now();
            let until = match self.sample.end {
                Some(end) if end < n => end,
                _ => n,
            };
            self.backfill(until).await;
            match self.sample.end {
                // No end configured: absorb the clock drift the backfill
                // accumulated, then continue on wall-clock ticks.
                None => {
                    let n = Utc::now();
                    self.backfill(n).await;
                    self.realtime = true;
                }
                Some(end) if end > n => self.backfill(end).await,
                Some(_) => {}
            }
        }

        if self.realtime {
            loop {
                if self.is_closed() {
                    break;
                }
                if self.sample.generator == Generator::Replay {
                    self.tick().await;
                    let offset = self
                        .sample
                        .replay_offsets
                        .get(self.cur)
                        .and_then(|d| d.to_std().ok())
                        .unwrap_or_default();
                    self.sleep_observing_close(offset).await;
                    if !self.sample.replay_offsets.is_empty() {
                        self.cur = (self.cur + 1) % self.sample.replay_offsets.len();
                    }
                } else {
                    self.sleep_observing_close(Duration::from_secs(self.sample.interval)).await;
                    if self.is_closed() {
                        break;
                    }
                    self.tick().await;
                }
            }
        }
        info!(sample = %self.sample.name, "timer finished");
    }

    /// Emit one item per interval until the cursor reaches `until`. No
    /// sleeping: backfill runs as fast as the queue accepts.
    async fn backfill(&mut self, until: DateTime<Utc>) {
        while self.current < until {
            self.tick().await;
            self.advance();
            if self.is_closed() {
                break;
            }
        }
    }

    fn advance(&mut self) {
        match self.sample.generator {
            Generator::Replay => {
                if let Some(offset) = self.sample.replay_offsets.get(self.cur) {
                    self.current += *offset;
                }
                if !self.sample.replay_offsets.is_empty() {
                    self.cur = (self.cur + 1) % self.sample.replay_offsets.len();
                }
            }
            _ => {
                self.current += chrono::Duration::seconds(self.sample.interval.max(1) as i64);
            }
        }
    }

    /// Build and enqueue one unit of generation work.
    async fn tick(&mut self) {
        let sample = self.sample.clone();
        let now = if self.realtime { Utc::now() } else { self.current };

        let use_cache = self.cache_counter > 0;
        let set_cache = !use_cache && self.cache_intervals > 0;
        self.cache_counter -= 1;
        if self.cache_counter < 0 {
            self.cache_counter = self.cache_intervals as i64;
        }
        let cache = CacheFlags { use_cache, set_cache };

        let item = if sample.generator == Generator::Replay {
            GenQueueItem {
                sample: sample.clone(),
                count: 1,
                event: Some(self.cur),
                earliest: now,
                latest: now,
                now,
                cache,
                out_tx: self.out_tx.clone(),
            }
        } else {
            let count = rater::event_rate(
                &sample,
                &sample.rater,
                now,
                sample.count,
                &mut self.rng,
                self.host.as_ref(),
            );
            GenQueueItem {
                sample: sample.clone(),
                count,
                event: None,
                earliest: now + sample.earliest_offset,
                latest: now + sample.latest_offset,
                now,
                cache,
                out_tx: self.out_tx.clone(),
            }
        };
        self.enqueue(item).await;
    }

    /// Send on the generator queue without deadlocking a shutdown: retry
    /// every second, observing the closed flag between attempts.
    async fn enqueue(&self, item: GenQueueItem) {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), self.gen_tx.send(item.clone())).await
            {
                Ok(Ok(())) => break,
                // Channel closed: the pipeline is shutting down.
                Ok(Err(_)) => break,
                Err(_) => {
                    if self.is_closed() {
                        debug!(sample = %self.sample.name, "timer closed while enqueueing");
                        break;
                    }
                }
            }
        }
    }

    /// Sleep for `dur`. Long sleeps poll the closed flag every second so a
    /// close is observed promptly.
    async fn sleep_observing_close(&self, dur: Duration) {
        if dur <= Duration::from_secs(5) {
            tokio::time::sleep(dur).await;
            return;
        }
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            if self.is_closed() {
                return;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return;
            }
            let step = (deadline - now).min(Duration::from_secs(1));
            tokio::time::sleep(step).await;
        }
    }
}
