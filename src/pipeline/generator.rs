//! Generator workers.
//!
//! Workers pull scheduling items off the generator queue and realize them
//! into event batches: token substitution for `sample`/`replay` generators,
//! script execution for custom ones. A `useCache` item short-circuits
//! generation entirely and forwards the sample's cached batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error};

use crate::pipeline::{Caches, GenQueueItem, OutQueueItem};
use crate::sample::{Event, Generator, RenderContext};
use crate::script::{EventEmitter, GeneratorBindings, GeneratorState, ScriptError, ScriptHost};

/// Worker loop: runs until the generator queue closes and drains.
pub async fn run_worker(
    id: usize,
    gen_rx: async_channel::Receiver<GenQueueItem>,
    caches: Arc<Caches>,
    host: Arc<dyn ScriptHost>,
) {
    let mut rng = StdRng::from_entropy();
    // Per-sample script state for generators that allow parallel invocation.
    let mut states: HashMap<String, GeneratorState> = HashMap::new();

    while let Ok(item) = gen_rx.recv().await {
        if item.cache.use_cache {
            let cached = caches
                .generation
                .read()
                .await
                .get(&item.sample.name)
                .cloned();
            if let Some(events) = cached {
                send_item(&item, events, &caches).await;
                continue;
            }
        }

        match &item.sample.generator {
            Generator::Sample | Generator::Replay => {
                let events = realize(&item, &mut rng, host.as_ref());
                send_item(&item, Arc::new(events), &caches).await;
            }
            Generator::Custom(name) => {
                if let Err(e) = run_custom(&item, &caches, host.as_ref(), &mut states).await {
                    error!(
                        sample = %item.sample.name,
                        generator = %name,
                        error = %e,
                        "generator script failed, dropping item"
                    );
                }
            }
        }
    }
    debug!(worker = id, "generator worker finished");
}

/// Store the batch when the item seeds the cache, then forward it as a
/// single output-queue item.
pub async fn send_item(item: &GenQueueItem, events: Arc<Vec<Event>>, caches: &Caches) {
    if item.cache.set_cache {
        caches
            .generation
            .write()
            .await
            .insert(item.sample.name.clone(), events.clone());
    }
    let out = OutQueueItem {
        sample: item.sample.clone(),
        events,
        cache: item.cache,
    };
    let _ = item.out_tx.send(out).await;
}

/// Realize a `sample` or `replay` item into concrete events.
fn realize(item: &GenQueueItem, rng: &mut StdRng, host: &dyn ScriptHost) -> Vec<Event> {
    let sample = &item.sample;
    if sample.lines.is_empty() {
        return Vec::new();
    }

    // Replay: exactly the requested line, stamped with the tick instant.
    if let Some(line_idx) = item.event {
        let mut choices = HashMap::new();
        let mut ctx = RenderContext {
            now: item.now,
            utc: sample.utc,
            rng,
            choices: &mut choices,
            host,
        };
        let idx = line_idx % sample.lines.len().max(1);
        return vec![sample.realize_line(idx, &mut ctx)];
    }

    let count = item.count.max(0) as usize;
    let mut events = Vec::with_capacity(count);
    let span = item.latest - item.earliest;
    let step = if count > 1 {
        span / (count as i32 - 1)
    } else {
        Duration::zero()
    };

    for i in 0..count {
        let (line_idx, now) = if sample.randomize_events {
            let frac = rng.gen::<f64>();
            let offset = span
                .num_nanoseconds()
                .map(|n| Duration::nanoseconds((n as f64 * frac) as i64))
                .unwrap_or_else(Duration::zero);
            (rng.gen_range(0..sample.lines.len()), item.earliest + offset)
        } else {
            // Walk lines round-robin, stepping instants evenly across the
            // window.
            (i % sample.lines.len(), item.earliest + step * i as i32)
        };

        let mut choices = HashMap::new();
        let mut ctx = RenderContext {
            now,
            utc: sample.utc,
            rng,
            choices: &mut choices,
            host,
        };
        events.push(sample.realize_line(line_idx, &mut ctx));
    }
    events
}

/// Emitter capability handed to custom generator scripts: batches emitted
/// mid-script flow straight into `send_item` with the current item's cache
/// settings.
struct ItemEmitter<'a> {
    item: &'a GenQueueItem,
    caches: &'a Caches,
}

#[async_trait]
impl EventEmitter for ItemEmitter<'_> {
    async fn emit(&mut self, events: Vec<Event>) {
        send_item(self.item, Arc::new(events), self.caches).await;
    }
}

/// Execute a custom generator script for one item. Single-threaded
/// generators hold the sample's execution lock for the whole run and share
/// its state; others keep state per worker.
async fn run_custom(
    item: &GenQueueItem,
    caches: &Caches,
    host: &dyn ScriptHost,
    states: &mut HashMap<String, GeneratorState>,
) -> Result<(), ScriptError> {
    let sample = &item.sample;
    let Some(custom) = sample.custom.as_ref() else {
        return Err(ScriptError::Failed(format!(
            "sample '{}' has no generator definition",
            sample.name
        )));
    };
    let bindings = GeneratorBindings {
        sample: sample.as_ref(),
        count: item.count,
        earliest: item.earliest,
        latest: item.latest,
        now: item.now,
        options: &custom.options,
    };
    let mut emitter = ItemEmitter { item, caches };

    if custom.single_threaded {
        let mut state = sample.exec_state.lock().await;
        host.run_generator(&custom.script, bindings, &mut state, &mut emitter)
            .await
    } else {
        let state = states.entry(sample.name.clone()).or_default();
        host.run_generator(&custom.script, bindings, state, &mut emitter)
            .await
    }
}
