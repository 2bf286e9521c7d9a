//! Scripting seam.
//!
//! Custom generators, script tokens, and script raters execute through a
//! [`ScriptHost`]. The host is an external collaborator: this crate defines
//! the calling convention (bindings in, events out through an emitter
//! capability) and ships only [`NullScriptHost`], which fails soft so that
//! misconfigured scripts degrade rather than abort the pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::sample::{Event, Sample};

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("no script host configured, script '{0}' skipped")]
    Unavailable(String),

    #[error("script execution failed: {0}")]
    Failed(String),
}

/// Key/value state a custom generator carries across invocations. With a
/// single-threaded generator the state lives on the sample and is guarded by
/// the sample's execution lock; otherwise each worker keeps its own.
#[derive(Debug, Default)]
pub struct GeneratorState {
    pub values: HashMap<String, String>,
}

/// Capability handed to a running generator script for emitting events
/// mid-execution. Emitted batches are forwarded downstream in emission order,
/// carrying the cache settings of the scheduling item that triggered the run.
#[async_trait]
pub trait EventEmitter: Send {
    async fn emit(&mut self, events: Vec<Event>);
}

/// Bindings exposed to one generator script invocation.
pub struct GeneratorBindings<'a> {
    pub sample: &'a Sample,
    pub count: i64,
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
    pub now: DateTime<Utc>,
    /// Free-form options from the generator definition.
    pub options: &'a HashMap<String, String>,
}

/// Interface to a script interpreter.
///
/// Implementations bind the sample's lines and tables, the timing fields of
/// the current work item, and engine callbacks (`send`, `set_token`,
/// `replace_tokens`, table getters, `sleep`, log helpers) into the script
/// environment, then execute it.
#[async_trait]
pub trait ScriptHost: Send + Sync {
    /// Run a custom generator script to completion.
    async fn run_generator(
        &self,
        script: &str,
        bindings: GeneratorBindings<'_>,
        state: &mut GeneratorState,
        emitter: &mut dyn EventEmitter,
    ) -> Result<(), ScriptError>;

    /// Evaluate a per-token script, returning the replacement string.
    /// `state` is the token's persistent key/value map.
    fn eval_token(
        &self,
        script: &str,
        state: &mut HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<String, ScriptError>;

    /// Evaluate a rater script, returning a rate multiplier.
    fn event_rate(&self, script: &str, now: DateTime<Utc>, count: i64)
        -> Result<f64, ScriptError>;
}

/// Host used when no interpreter is wired in. Every call fails soft; callers
/// log and drop the work item or leave the placeholder untouched.
pub struct NullScriptHost;

#[async_trait]
impl ScriptHost for NullScriptHost {
    async fn run_generator(
        &self,
        script: &str,
        _bindings: GeneratorBindings<'_>,
        _state: &mut GeneratorState,
        _emitter: &mut dyn EventEmitter,
    ) -> Result<(), ScriptError> {
        Err(ScriptError::Unavailable(preview(script)))
    }

    fn eval_token(
        &self,
        script: &str,
        _state: &mut HashMap<String, String>,
        _now: DateTime<Utc>,
    ) -> Result<String, ScriptError> {
        Err(ScriptError::Unavailable(preview(script)))
    }

    fn event_rate(
        &self,
        script: &str,
        _now: DateTime<Utc>,
        _count: i64,
    ) -> Result<f64, ScriptError> {
        Err(ScriptError::Unavailable(preview(script)))
    }
}

fn preview(script: &str) -> String {
    script
        .lines()
        .next()
        .unwrap_or_default()
        .chars()
        .take(40)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_host_fails_soft() {
        let host = NullScriptHost;
        let mut state = HashMap::new();
        let err = host.eval_token("return 1", &mut state, Utc::now());
        assert!(matches!(err, Err(ScriptError::Unavailable(_))));
    }
}
