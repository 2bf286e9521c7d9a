//! The three-stage pipeline: timers → generator workers → output workers.
//!
//! Two bounded MPMC queues connect the stages; backpressure is the only
//! admission control. Shutdown cascades in stage order through channel
//! closure: closing the timers drops the generator-queue senders, the
//! generator workers drain and exit dropping the output-queue senders, the
//! output workers drain and exit, and finally the stats aggregator drains
//! for exact totals. No stage closes before its producers exit.

pub mod generator;
pub mod outputter;
pub mod stats;
pub mod timer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigError, GlobalConfig};
use crate::output::format::TemplateSet;
use crate::output::BufRegistry;
use crate::sample::{BuildContext, Event, Sample};
use crate::script::ScriptHost;
use timer::{Timer, TimerHandle};

/// Cache disposition of one scheduling cohort.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheFlags {
    /// Reuse the sample's cached batch instead of generating.
    pub use_cache: bool,
    /// Store this tick's batch for the following `USE` ticks.
    pub set_cache: bool,
}

/// One unit of generation work.
#[derive(Clone)]
pub struct GenQueueItem {
    pub sample: Arc<Sample>,
    /// Number of events to realize.
    pub count: i64,
    /// `Some(line)` pins generation to exactly that line (replay);
    /// `None` lets the generator choose lines freely.
    pub event: Option<usize>,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub cache: CacheFlags,
    /// Where the realized batch goes; carried on the item so emission order
    /// follows generation order even mid-script.
    pub out_tx: async_channel::Sender<OutQueueItem>,
}

/// One unit of output work: the full batch of a single scheduler tick.
#[derive(Clone)]
pub struct OutQueueItem {
    pub sample: Arc<Sample>,
    pub events: Arc<Vec<Event>>,
    pub cache: CacheFlags,
}

/// The pipeline's shared caches, owned by one pipeline instance.
pub struct Caches {
    /// Generated batches by sample name; written under `setCache`.
    pub generation: RwLock<HashMap<String, Arc<Vec<Event>>>>,
    /// Serialized payloads by sample name; maintained by output workers.
    pub output: RwLock<HashMap<String, Bytes>>,
}

impl Caches {
    pub fn new() -> Self {
        Caches {
            generation: RwLock::new(HashMap::new()),
            output: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Caches::new()
    }
}

/// Close control for a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    timers: Vec<TimerHandle>,
}

impl PipelineHandle {
    /// Stop scheduling on every timer. The pipeline then drains and exits.
    pub fn close(&self) {
        for timer in &self.timers {
            timer.close();
        }
    }
}

/// Final totals after the pipeline drains.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSummary {
    pub events: u64,
    pub bytes: u64,
}

/// A fully wired pipeline, ready to run.
pub struct Pipeline {
    global: GlobalConfig,
    templates: Arc<TemplateSet>,
    host: Arc<dyn ScriptHost>,
    buffers: BufRegistry,
    timers: Vec<Timer>,
    timer_handles: Vec<TimerHandle>,
    gen_rx: async_channel::Receiver<GenQueueItem>,
    out_rx: async_channel::Receiver<OutQueueItem>,
}

impl Pipeline {
    /// Validate the configuration and wire channels and timers. Samples that
    /// fail validation are disabled; a config with no runnable samples is
    /// the one fatal startup error.
    pub fn new(config: Config, host: Arc<dyn ScriptHost>) -> Result<Self, ConfigError> {
        let raters = config.rater_registry();
        let generators = config.generator_registry();
        let tables = config.sample_tables();
        let ctx = BuildContext {
            output: &config.global.output,
            utc: config.global.utc,
            add_time: config.global.add_time,
            raters: &raters,
            generators: &generators,
            tables: &tables,
        };

        let mut samples = Vec::new();
        for raw in &config.samples {
            if raw.disabled {
                continue;
            }
            match Sample::build(raw, &ctx) {
                Ok(sample) => {
                    info!(
                        sample = %sample.name,
                        generator = ?sample.generator,
                        single_pass = sample.single_pass,
                        "sample ready"
                    );
                    samples.push(Arc::new(sample));
                }
                Err(e) => error!(sample = %raw.name, error = %e, "disabling sample"),
            }
        }
        if samples.is_empty() {
            return Err(ConfigError::NoSamples);
        }

        let templates = Arc::new(TemplateSet::build(&config.templates));
        let buffers: BufRegistry = Arc::new(Mutex::new(HashMap::new()));

        let (gen_tx, gen_rx) =
            async_channel::bounded(config.global.generator_queue_length.max(1));
        let (out_tx, out_rx) = async_channel::bounded(config.global.output_queue_length.max(1));

        let mut timers = Vec::with_capacity(samples.len());
        let mut timer_handles = Vec::with_capacity(samples.len());
        for sample in &samples {
            let (timer, handle) = Timer::new(
                sample.clone(),
                gen_tx.clone(),
                out_tx.clone(),
                config.global.cache_intervals,
                host.clone(),
            );
            timers.push(timer);
            timer_handles.push(handle);
        }
        // The timers hold the only senders; when the last one finishes, the
        // queues close behind it.

        Ok(Pipeline {
            global: config.global,
            templates,
            host,
            buffers,
            timers,
            timer_handles,
            gen_rx,
            out_rx,
        })
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            timers: self.timer_handles.clone(),
        }
    }

    /// The `buf` sink's capture registry.
    pub fn buffers(&self) -> BufRegistry {
        self.buffers.clone()
    }

    /// Run the pipeline to completion: all timers done (bounded windows
    /// exhausted or handle closed), queues drained in stage order, stats
    /// finalized.
    pub async fn run(self) -> PipelineSummary {
        let stats = stats::Stats::start(self.global.rot_interval);
        let caches = Arc::new(Caches::new());

        info!(timers = self.timers.len(), "starting timers");
        let mut timer_tasks = Vec::with_capacity(self.timers.len());
        for timer in self.timers {
            timer_tasks.push(tokio::spawn(timer.run()));
        }

        info!(workers = self.global.generator_workers, "starting generators");
        let mut generator_tasks = Vec::new();
        for id in 0..self.global.generator_workers.max(1) {
            generator_tasks.push(tokio::spawn(generator::run_worker(
                id,
                self.gen_rx.clone(),
                caches.clone(),
                self.host.clone(),
            )));
        }
        drop(self.gen_rx);

        info!(workers = self.global.output_workers, "starting outputters");
        let mut output_tasks = Vec::new();
        for id in 0..self.global.output_workers.max(1) {
            output_tasks.push(tokio::spawn(outputter::run_worker(
                id,
                self.out_rx.clone(),
                caches.clone(),
                stats.handle(),
                self.templates.clone(),
                self.buffers.clone(),
                self.global.rot_interval,
            )));
        }
        drop(self.out_rx);

        for task in timer_tasks {
            let _ = task.await;
        }
        debug!("all timers done, generator queue closing");
        for task in generator_tasks {
            let _ = task.await;
        }
        debug!("generators done, output queue closing");
        for task in output_tasks {
            let _ = task.await;
        }

        let (events, bytes) = stats.read_final().await;
        PipelineSummary { events, bytes }
    }
}
