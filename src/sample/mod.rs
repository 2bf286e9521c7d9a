//! Sample model and token substitution.
//!
//! A sample is the design unit: an ordered set of template lines, the tokens
//! that substitute into them, pacing, and an output binding. Raw
//! [`SampleConfig`](crate::config::SampleConfig) records are validated into
//! [`Sample`] at startup; any rule violation disables the sample without
//! halting the process.
//!
//! Tokens are stored in an arena (`Sample::tokens`) and referenced by index
//! from the precomputed single-pass segments, so there are no cyclic owning
//! pointers between samples, lines, and tokens.

pub mod token;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{OutputConfig, SampleConfig, TokenConfig};
use crate::rater::RaterSpec;
use crate::script::GeneratorState;
use crate::timespec::TimeSpec;

pub use token::{
    Event, RandomKind, RenderContext, Token, TokenFormat, TokenKind, WeightedEntry,
    TIMESTAMP_GROUP,
};

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("sample has no name")]
    NoName,

    #[error("sample '{0}' has no lines")]
    NoLines(String),

    #[error("earliest is later than latest for sample '{0}'")]
    TimeRange(String),

    #[error("token '{token}' invalid in sample '{sample}': {reason}")]
    BadToken {
        sample: String,
        token: String,
        reason: String,
    },

    #[error("no parseable timestamp in line {line} of replay sample '{sample}'")]
    ReplayIndex { sample: String, line: usize },

    #[error("generator '{generator}' not found for sample '{sample}'")]
    UnknownGenerator { sample: String, generator: String },
}

/// How a sample's events are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generator {
    /// Realize `count` events per tick from the sample's lines.
    Sample,
    /// Emit the sample's own lines one at a time at their original
    /// inter-arrival spacing.
    Replay,
    /// A named custom generator script.
    Custom(String),
}

/// A resolved custom generator definition.
#[derive(Debug, Clone, Default)]
pub struct CustomGenerator {
    pub name: String,
    pub script: String,
    /// Forbid parallel invocation; state lives on the sample under its
    /// execution lock.
    pub single_threaded: bool,
    pub options: HashMap<String, String>,
}

/// One piece of a pre-sliced field: either a literal fragment or a reference
/// into the sample's token arena.
#[derive(Debug, Clone)]
pub enum Segment {
    Literal(String),
    Token(usize),
}

/// Everything needed to build samples: the global output binding and the
/// registries resolved from config.
pub struct BuildContext<'a> {
    pub output: &'a OutputConfig,
    pub utc: bool,
    pub add_time: bool,
    pub raters: &'a HashMap<String, RaterSpec>,
    pub generators: &'a HashMap<String, CustomGenerator>,
    /// Raw lines of every loaded sample, for token lookup tables.
    pub tables: &'a HashMap<String, Vec<Event>>,
}

/// A validated sample. Immutable once built; scheduling cursors live in the
/// sample's Timer, and custom-generator state lives behind `exec_state`.
pub struct Sample {
    pub name: String,
    pub description: String,
    pub generator: Generator,
    pub lines: Vec<Event>,
    pub tokens: Vec<Token>,

    /// Default field tokens substitute into.
    pub field: String,

    /// Signed offsets from a tick's `now` bounding each event's instant.
    pub earliest_offset: Duration,
    pub latest_offset: Duration,

    pub begin: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Start directly on wall-clock ticks. A sample with a begin but no end
    /// starts false and switches to realtime once its backfill catches up.
    pub realtime: bool,

    /// Seconds between ticks.
    pub interval: u64,
    pub count: i64,
    pub end_intervals: u64,

    pub randomize_events: bool,
    pub randomize_count: f64,
    pub utc: bool,
    pub rater: RaterSpec,

    /// Whether every line qualifies for pre-sliced rendering.
    pub single_pass: bool,
    /// Per line, per field: alternating literal fragments and token refs.
    pub broken_lines: Vec<HashMap<String, Vec<Segment>>>,

    /// Replay spacing; entry 0 is the mean of the rest.
    pub replay_offsets: Vec<Duration>,

    /// Mean serialized size of the default field, for kbps rating.
    pub avg_event_bytes: f64,

    pub output: OutputConfig,
    pub custom: Option<CustomGenerator>,

    /// Serializes custom-generator execution for single-threaded generators
    /// and carries their persistent state.
    pub exec_state: Mutex<GeneratorState>,
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample")
            .field("name", &self.name)
            .field("generator", &self.generator)
            .field("lines", &self.lines.len())
            .field("tokens", &self.tokens.len())
            .field("interval", &self.interval)
            .field("count", &self.count)
            .field("realtime", &self.realtime)
            .field("single_pass", &self.single_pass)
            .finish_non_exhaustive()
    }
}

impl Sample {
    /// A bare sample with defaults. Building block for tests and benches.
    pub fn empty(name: &str) -> Self {
        Sample {
            name: name.to_string(),
            description: String::new(),
            generator: Generator::Sample,
            lines: Vec::new(),
            tokens: Vec::new(),
            field: "_raw".to_string(),
            earliest_offset: Duration::zero(),
            latest_offset: Duration::zero(),
            begin: None,
            end: None,
            realtime: true,
            interval: 0,
            count: 0,
            end_intervals: 0,
            randomize_events: false,
            randomize_count: 0.0,
            utc: false,
            rater: RaterSpec::Default,
            single_pass: false,
            broken_lines: Vec::new(),
            replay_offsets: Vec::new(),
            avg_event_bytes: 0.0,
            output: OutputConfig::default(),
            custom: None,
            exec_state: Mutex::new(GeneratorState::default()),
        }
    }

    /// Validate a raw sample definition into a runnable sample.
    pub fn build(cfg: &SampleConfig, ctx: &BuildContext<'_>) -> Result<Self, SampleError> {
        if cfg.name.is_empty() {
            return Err(SampleError::NoName);
        }
        let generator = match cfg.generator.as_str() {
            "" | "sample" => Generator::Sample,
            "replay" => Generator::Replay,
            other => Generator::Custom(other.to_string()),
        };
        if cfg.lines.is_empty() && !matches!(generator, Generator::Custom(_)) {
            return Err(SampleError::NoLines(cfg.name.clone()));
        }
        let field = if cfg.field.is_empty() {
            "_raw".to_string()
        } else {
            cfg.field.clone()
        };

        // Pacing. Without an interval a non-replay sample generates once and
        // finishes; endIntervals overrides begin/end.
        let mut interval = cfg.interval;
        let mut end_intervals = cfg.end_intervals;
        if interval == 0 && end_intervals == 0 && !matches!(generator, Generator::Replay) {
            info!(sample = %cfg.name, "no interval set, generating a single interval");
            end_intervals = 1;
        }
        let (begin_spec, end_spec) = if end_intervals > 0 {
            if interval == 0 {
                interval = 1;
            }
            (format!("-{}s", end_intervals * interval), "now".to_string())
        } else {
            (cfg.begin.clone(), cfg.end.clone())
        };

        let reference = Utc::now();
        let begin = parse_boundary(&cfg.name, "begin", &begin_spec, reference);
        let end = parse_boundary(&cfg.name, "end", &end_spec, reference);
        // A begin without an end backfills first, then switches to realtime.
        let realtime = end.is_none() && begin.is_none();

        let earliest_offset = parse_offset(&cfg.name, "earliest", &cfg.earliest, reference);
        let latest_offset = parse_offset(&cfg.name, "latest", &cfg.latest, reference);
        if earliest_offset > latest_offset {
            return Err(SampleError::TimeRange(cfg.name.clone()));
        }

        let mut tokens = Vec::with_capacity(cfg.tokens.len());
        for tc in &cfg.tokens {
            tokens.push(build_token(tc, cfg, &field, ctx)?);
        }

        let custom = match &generator {
            Generator::Custom(name) => Some(ctx.generators.get(name).cloned().ok_or_else(
                || SampleError::UnknownGenerator {
                    sample: cfg.name.clone(),
                    generator: name.clone(),
                },
            )?),
            _ => None,
        };

        let rater_name = if cfg.rater.is_empty() {
            "default"
        } else {
            cfg.rater.as_str()
        };
        let rater = match ctx.raters.get(rater_name) {
            Some(spec) => spec.clone(),
            None => {
                error!(sample = %cfg.name, rater = rater_name, "rater not found, using default");
                RaterSpec::Default
            }
        };

        let mut sample = Sample {
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            generator,
            lines: cfg.lines.clone(),
            tokens,
            field,
            earliest_offset,
            latest_offset,
            begin,
            end,
            realtime,
            interval,
            count: cfg.count,
            end_intervals,
            randomize_events: cfg.randomize_events,
            randomize_count: cfg.randomize_count,
            utc: ctx.utc,
            rater,
            single_pass: false,
            broken_lines: Vec::new(),
            replay_offsets: Vec::new(),
            avg_event_bytes: 0.0,
            output: ctx.output.clone(),
            custom,
            exec_state: Mutex::new(GeneratorState::default()),
        };

        inject_system_tokens(&mut sample, ctx.add_time);

        sample.avg_event_bytes = mean_field_bytes(&sample.lines, &sample.field);

        let (single_pass, broken_lines) = compute_single_pass(&sample.name, &sample.lines, &sample.tokens);
        sample.single_pass = single_pass;
        sample.broken_lines = broken_lines;

        if sample.generator == Generator::Replay {
            sample.replay_offsets = build_replay_index(&sample.name, &sample.lines, &sample.tokens)?;
        }

        Ok(sample)
    }

    /// Whether the custom generator (if any) forbids parallel invocation.
    pub fn single_threaded(&self) -> bool {
        self.custom.as_ref().is_some_and(|c| c.single_threaded)
    }

    /// Render a concrete event from line `idx`.
    pub fn realize_line(&self, idx: usize, ctx: &mut RenderContext<'_>) -> Event {
        if self.single_pass {
            self.render_single_pass(idx, ctx)
        } else {
            let mut event = self.lines[idx].clone();
            self.replace_tokens(&mut event, ctx);
            event
        }
    }

    /// Pre-sliced rendering: walk the field's segments once, appending
    /// literal fragments and token renders. No template scanning at runtime.
    fn render_single_pass(&self, idx: usize, ctx: &mut RenderContext<'_>) -> Event {
        let broken = &self.broken_lines[idx];
        let mut event = Event::with_capacity(broken.len());
        for (field, segments) in broken {
            let mut out = String::new();
            for segment in segments {
                match segment {
                    Segment::Literal(s) => out.push_str(s),
                    Segment::Token(i) => {
                        let tok = &self.tokens[*i];
                        match tok.render(ctx) {
                            Ok(v) => out.push_str(&v),
                            Err(e) => {
                                debug!(sample = %self.name, token = %tok.name, error = %e,
                                       "token render failed, leaving placeholder");
                                out.push_str(&tok.marker);
                            }
                        }
                    }
                }
            }
            event.insert(field.clone(), out);
        }
        event
    }

    /// Multi-pass substitution of every configured token into `event`.
    pub fn replace_tokens(&self, event: &mut Event, ctx: &mut RenderContext<'_>) {
        replace_token_list(&self.name, &self.tokens, event, ctx);
    }
}

/// Substitute a token list into an event, multi-pass: for each token,
/// repeatedly find the first remaining occurrence, splice in the rendered
/// replacement, and advance past it so rendered output is never re-entered.
pub fn replace_token_list(
    sample_name: &str,
    tokens: &[Token],
    event: &mut Event,
    ctx: &mut RenderContext<'_>,
) {
    for tok in tokens {
        let Some(current) = event.get(&tok.field) else {
            continue;
        };
        let mut value = current.clone();
        let mut cursor = 0;
        while cursor <= value.len() {
            let Some((start, end)) = first_offset(tok, &value[cursor..]) else {
                break;
            };
            let (start, end) = (cursor + start, cursor + end);
            match tok.render(ctx) {
                Ok(replacement) => {
                    value.replace_range(start..end, &replacement);
                    cursor = start + replacement.len();
                }
                Err(e) => {
                    debug!(sample = %sample_name, token = %tok.name, error = %e,
                           "token render failed, leaving placeholder");
                    cursor = end;
                }
            }
        }
        event.insert(tok.field.clone(), value);
    }
}

/// The first replacement span of `tok` within `hay`.
fn first_offset(tok: &Token, hay: &str) -> Option<(usize, usize)> {
    match tok.format {
        TokenFormat::Template => {
            if tok.marker.is_empty() {
                return None;
            }
            hay.find(tok.marker.as_str())
                .map(|start| (start, start + tok.marker.len()))
        }
        TokenFormat::Regex => {
            let re = tok.regex.as_ref()?;
            let caps = re.captures(hay)?;
            let m = caps.get(1).or_else(|| caps.get(0))?;
            Some((m.start(), m.end()))
        }
    }
}

fn parse_boundary(
    sample: &str,
    what: &str,
    spec: &str,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if spec.is_empty() {
        return None;
    }
    match TimeSpec::parse(spec) {
        Ok(t) => Some(t.resolve(reference)),
        Err(e) => {
            error!(sample, what, error = %e, "cannot parse time boundary");
            None
        }
    }
}

fn parse_offset(sample: &str, what: &str, spec: &str, reference: DateTime<Utc>) -> Duration {
    if spec.is_empty() {
        return Duration::zero();
    }
    match TimeSpec::parse(spec) {
        Ok(t) => t.offset_from(reference),
        Err(e) => {
            error!(sample, what, error = %e, "cannot parse time offset, using now");
            Duration::zero()
        }
    }
}

fn mean_field_bytes(lines: &[Event], field: &str) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    let total: usize = lines.iter().map(|l| l.get(field).map_or(0, String::len)).sum();
    total as f64 / lines.len() as f64
}

fn build_token(
    tc: &TokenConfig,
    cfg: &SampleConfig,
    default_field: &str,
    ctx: &BuildContext<'_>,
) -> Result<Token, SampleError> {
    let bad = |reason: String| SampleError::BadToken {
        sample: cfg.name.clone(),
        token: tc.name.clone(),
        reason,
    };

    let format = match tc.format.as_str() {
        "regex" => TokenFormat::Regex,
        _ => TokenFormat::Template,
    };
    let field = if tc.field.is_empty() {
        default_field.to_string()
    } else {
        tc.field.clone()
    };
    let marker = if format == TokenFormat::Template && tc.token.is_empty() {
        format!("${}$", tc.name)
    } else {
        tc.token.clone()
    };
    let regex = match format {
        TokenFormat::Regex => {
            Some(Regex::new(&tc.token).map_err(|e| bad(format!("bad pattern: {e}")))?)
        }
        TokenFormat::Template => None,
    };

    let table = (!tc.sample.is_empty())
        .then(|| ctx.tables.get(&tc.sample))
        .flatten();

    let kind = match tc.token_type.as_str() {
        "random" => TokenKind::Random(random_kind(tc).map_err(bad)?),
        "rated" => {
            let rater_name = if tc.rater.is_empty() {
                "default"
            } else {
                tc.rater.as_str()
            };
            TokenKind::Rated {
                kind: random_kind(tc).map_err(bad)?,
                rater: ctx.raters.get(rater_name).cloned().unwrap_or_default(),
            }
        }
        "choice" => {
            let mut items = tc.choice.clone();
            if items.is_empty() {
                if let Some(rows) = table {
                    items = rows
                        .iter()
                        .filter_map(|r| r.get("_raw"))
                        .filter(|v| !v.is_empty())
                        .cloned()
                        .collect();
                }
            }
            if items.is_empty() {
                return Err(bad("zero choice items".to_string()));
            }
            TokenKind::Choice(items)
        }
        "weightedChoice" => {
            let mut entries: Vec<WeightedEntry> = tc
                .weighted_choice
                .iter()
                .map(|w| WeightedEntry {
                    weight: w.weight,
                    choice: w.choice.clone(),
                })
                .collect();
            if entries.is_empty() {
                if let Some(rows) = table {
                    entries = rows
                        .iter()
                        .filter_map(|r| {
                            let choice = r.get(&tc.src_field)?.clone();
                            let weight = r.get("_weight").and_then(|w| w.parse().ok()).unwrap_or(0);
                            Some(WeightedEntry { weight, choice })
                        })
                        .collect();
                }
            }
            if entries.is_empty() {
                return Err(bad("zero choice items".to_string()));
            }
            TokenKind::WeightedChoice(entries)
        }
        "fieldChoice" => {
            let rows = if tc.field_choice.is_empty() {
                table.cloned().unwrap_or_default()
            } else {
                tc.field_choice.clone()
            };
            if rows.is_empty() {
                return Err(bad("zero choice items".to_string()));
            }
            if let Some(row) = rows.iter().find(|r| !r.contains_key(&tc.src_field)) {
                return Err(bad(format!(
                    "source field '{}' missing from row {row:?}",
                    tc.src_field
                )));
            }
            TokenKind::FieldChoice {
                rows,
                src_field: tc.src_field.clone(),
            }
        }
        "timestamp" => TokenKind::Timestamp {
            format: token::normalize_strftime(&tc.replacement),
        },
        "gotimestamp" => TokenKind::GoTimestamp {
            format: token::go_layout_to_strftime(&tc.replacement),
        },
        "epochtimestamp" => TokenKind::EpochTimestamp,
        "script" => TokenKind::Script {
            script: tc.script.clone(),
            state: std::sync::Mutex::new(tc.init.clone()),
        },
        "static" => TokenKind::Static(tc.replacement.clone()),
        other => return Err(bad(format!("unknown token type '{other}'"))),
    };

    Ok(Token {
        name: tc.name.clone(),
        field,
        format,
        marker,
        regex,
        group: tc.group,
        kind,
    })
}

fn random_kind(tc: &TokenConfig) -> Result<RandomKind, String> {
    match tc.replacement.as_str() {
        "int" => {
            if tc.lower > tc.upper {
                Err("lower cannot be greater than upper".to_string())
            } else if tc.upper == 0 {
                Err("upper cannot be zero".to_string())
            } else {
                Ok(RandomKind::Int {
                    lower: tc.lower,
                    upper: tc.upper,
                })
            }
        }
        "float" => {
            if tc.lower > tc.upper {
                Err("lower cannot be greater than upper".to_string())
            } else if tc.upper == 0 {
                Err("upper cannot be zero".to_string())
            } else {
                Ok(RandomKind::Float {
                    lower: tc.lower as f64,
                    upper: tc.upper as f64,
                    precision: tc.precision,
                })
            }
        }
        "string" => {
            if tc.length == 0 {
                Err("length cannot be zero".to_string())
            } else {
                Ok(RandomKind::String { length: tc.length })
            }
        }
        "hex" => {
            if tc.length == 0 {
                Err("length cannot be zero".to_string())
            } else {
                Ok(RandomKind::Hex { length: tc.length })
            }
        }
        "guid" => Ok(RandomKind::Guid),
        "ipv4" => Ok(RandomKind::Ipv4),
        "ipv6" => Ok(RandomKind::Ipv6),
        other => Err(format!("replacement '{other}' is invalid")),
    }
}

/// Inject the tokens and fields the output template requires: a timestamp
/// token for time-carrying templates, syslog metadata fields, the
/// line-breaker marker for S2S, and forwarder channels.
fn inject_system_tokens(sample: &mut Sample, add_time: bool) {
    let template = sample.output.output_template.clone();
    let syslog = template == "rfc3164" || template == "rfc5424";
    let s2s = template.starts_with("splunktcp");
    let add_time =
        add_time || syslog || s2s || template == "splunkhec" || template == "elasticsearch";
    if !add_time {
        return;
    }

    let (time_name, time_kind) = match template.as_str() {
        "elasticsearch" => (
            "@timestamp",
            TokenKind::GoTimestamp {
                format: token::go_layout_to_strftime("2006-01-02T15:04:05.999Z07:00"),
            },
        ),
        "rfc3164" => (
            "_time",
            TokenKind::GoTimestamp {
                format: token::go_layout_to_strftime("Jan _2 15:04:05"),
            },
        ),
        "rfc5424" => (
            "_time",
            TokenKind::GoTimestamp {
                format: token::go_layout_to_strftime("2006-01-02T15:04:05.999999Z07:00"),
            },
        ),
        _ => ("_time", TokenKind::EpochTimestamp),
    };
    add_token(sample, time_name, time_kind);

    if syslog {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let tag = sample
            .lines
            .first()
            .and_then(|l| l.get("sourcetype"))
            .filter(|s| !s.is_empty())
            .cloned()
            .unwrap_or_else(|| "eventforge".to_string());
        add_field(sample, "priority", "13");
        add_field(sample, "host", &host);
        add_field(sample, "tag", &tag);
        add_field(sample, "pid", &std::process::id().to_string());
        add_field(sample, "appName", "eventforge");
    }
    if template == "splunktcp" {
        add_field(sample, "_linebreaker", "_linebreaker");
    }
    if template == "splunktcpuf" {
        let pool = (0..8).map(|_| Uuid::new_v4().to_string()).collect();
        add_token(sample, "_channel", TokenKind::Channel { pool });
    }

    // All timestamp-family tokens share the system group so a line renders a
    // single consistent instant.
    for tok in &mut sample.tokens {
        if tok.kind.is_timestamp() {
            tok.group = TIMESTAMP_GROUP;
        }
    }
}

/// Add a template token named `name` targeting field `name`, unless the
/// sample already defines the token or the field.
fn add_token(sample: &mut Sample, name: &str, kind: TokenKind) {
    let already = sample.tokens.iter().any(|t| t.name == name)
        || sample.lines.iter().any(|l| l.contains_key(name));
    if already {
        return;
    }
    info!(sample = %sample.name, token = name, "adding system token");
    let group = if kind.is_timestamp() { TIMESTAMP_GROUP } else { 0 };
    sample.tokens.push(Token {
        name: name.to_string(),
        field: name.to_string(),
        format: TokenFormat::Template,
        marker: format!("${name}$"),
        regex: None,
        group,
        kind,
    });
    for line in &mut sample.lines {
        line.insert(name.to_string(), format!("${name}$"));
    }
}

/// Set `name` on every line that does not already carry a value for it.
fn add_field(sample: &mut Sample, name: &str, value: &str) {
    for line in &mut sample.lines {
        let entry = line.entry(name.to_string()).or_default();
        if entry.is_empty() {
            *entry = value.to_string();
        }
    }
}

type TokenSpan = (usize, usize, usize); // start, end, token index

/// Determine single-pass eligibility and pre-slice every line.
///
/// A sample qualifies when every token's offsets can be located in every
/// line, spans within a field never overlap, and the maximum end position is
/// non-decreasing. Qualifying lines are rebuilt as alternating literal
/// fragments and token references.
fn compute_single_pass(
    name: &str,
    lines: &[Event],
    tokens: &[Token],
) -> (bool, Vec<HashMap<String, Vec<Segment>>>) {
    let mut spans_per_line: Vec<HashMap<String, Vec<TokenSpan>>> = Vec::with_capacity(lines.len());

    for line in lines {
        let mut spans: HashMap<String, Vec<TokenSpan>> = HashMap::new();
        for (j, tok) in tokens.iter().enumerate() {
            let value = line.get(&tok.field).map(String::as_str).unwrap_or_default();
            let offsets = tok.offsets(value);
            if offsets.is_empty() {
                debug!(sample = name, token = %tok.name, "token not found in line, multi-pass rendering");
                return (false, Vec::new());
            }
            for (start, end) in offsets {
                spans.entry(tok.field.clone()).or_default().push((start, end, j));
            }
        }

        for positions in spans.values_mut() {
            positions.sort_by_key(|&(start, _, _)| start);
            let mut last_end = 0;
            let mut max_end = 0;
            for &(start, end, j) in positions.iter() {
                if last_end > start || max_end > start {
                    debug!(sample = name, token = %tokens[j].name,
                           "overlapping token spans, multi-pass rendering");
                    return (false, Vec::new());
                }
                max_end = max_end.max(end);
                last_end = end;
            }
        }
        spans_per_line.push(spans);
    }

    let mut broken_lines = Vec::with_capacity(lines.len());
    for (line, spans) in lines.iter().zip(&spans_per_line) {
        let mut broken: HashMap<String, Vec<Segment>> = HashMap::with_capacity(line.len());
        for (field, value) in line {
            let mut segments = Vec::new();
            match spans.get(field) {
                None => segments.push(Segment::Literal(value.clone())),
                Some(positions) => {
                    let mut last = 0;
                    for &(start, end, j) in positions {
                        if start > last {
                            segments.push(Segment::Literal(value[last..start].to_string()));
                        }
                        segments.push(Segment::Token(j));
                        last = end;
                    }
                    if last < value.len() {
                        segments.push(Segment::Literal(value[last..].to_string()));
                    }
                }
            }
            broken.insert(field.clone(), segments);
        }
        broken_lines.push(broken);
    }

    (true, broken_lines)
}

/// Walk a replay sample's lines, parse the first timestamp token of each,
/// and derive per-line sleep offsets. Offset 0 is the mean of the rest. A
/// parse failure disables the sample.
fn build_replay_index(
    name: &str,
    lines: &[Event],
    tokens: &[Token],
) -> Result<Vec<Duration>, SampleError> {
    let mut offsets = vec![Duration::zero(); lines.len()];
    let mut last: Option<DateTime<Utc>> = None;

    for (i, line) in lines.iter().enumerate() {
        let mut parsed = None;
        for tok in tokens.iter().filter(|t| t.kind.is_timestamp()) {
            let Some(value) = line.get(&tok.field) else {
                continue;
            };
            let offs = tok.offsets(value);
            let Some(&(start, end)) = offs.first() else {
                continue;
            };
            parsed = tok.parse_timestamp(&value[start..end]);
            break;
        }
        let Some(ts) = parsed else {
            return Err(SampleError::ReplayIndex {
                sample: name.to_string(),
                line: i,
            });
        };
        if let Some(prev) = last {
            offsets[i] = ts - prev;
        }
        last = Some(ts);
    }

    if lines.len() > 1 {
        let sum = offsets[1..]
            .iter()
            .fold(Duration::zero(), |acc, d| acc + *d);
        offsets[0] = sum / (lines.len() as i32 - 1);
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, WeightedChoiceConfig};
    use crate::script::NullScriptHost;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn build_ctx<'a>(
        output: &'a OutputConfig,
        raters: &'a HashMap<String, RaterSpec>,
        generators: &'a HashMap<String, CustomGenerator>,
        tables: &'a HashMap<String, Vec<Event>>,
    ) -> BuildContext<'a> {
        BuildContext {
            output,
            utc: true,
            add_time: false,
            raters,
            generators,
            tables,
        }
    }

    fn simple_sample(yaml: &str) -> Sample {
        let cfg = Config::from_yaml(yaml).unwrap();
        let output = OutputConfig::default();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        Sample::build(&cfg.samples[0], &ctx).unwrap()
    }

    fn render_ctx<'a>(
        rng: &'a mut StdRng,
        choices: &'a mut HashMap<i32, usize>,
        host: &'a NullScriptHost,
    ) -> RenderContext<'a> {
        RenderContext {
            now: Utc::now(),
            utc: true,
            rng,
            choices,
            host,
        }
    }

    #[test]
    fn test_static_token_render() {
        let sample = simple_sample(
            r#"
samples:
  - name: statics
    count: 1
    interval: 1
    endIntervals: 1
    tokens:
      - name: what
        type: static
        replacement: world
    lines:
      - _raw: hello $what$
"#,
        );
        assert!(sample.single_pass);

        let host = NullScriptHost;
        let mut rng = StdRng::seed_from_u64(1);
        let mut choices = HashMap::new();
        let mut ctx = render_ctx(&mut rng, &mut choices, &host);
        let event = sample.realize_line(0, &mut ctx);
        assert_eq!(event["_raw"], "hello world");
    }

    #[test]
    fn test_single_pass_disabled_on_missing_token() {
        let sample = simple_sample(
            r#"
samples:
  - name: missing
    endIntervals: 1
    tokens:
      - name: absent
        type: static
        replacement: x
    lines:
      - _raw: no marker here
"#,
        );
        assert!(!sample.single_pass);
    }

    #[test]
    fn test_single_pass_matches_multi_pass() {
        let yaml = r#"
samples:
  - name: equivalence
    endIntervals: 1
    tokens:
      - name: user
        type: choice
        choice: [alice, bob, carol]
      - name: n
        type: random
        replacement: int
        lower: 1
        upper: 100
    lines:
      - _raw: user=$user$ n=$n$ done
"#;
        let single = simple_sample(yaml);
        assert!(single.single_pass);
        let mut multi = simple_sample(yaml);
        multi.single_pass = false;

        let host = NullScriptHost;
        let now = Utc::now();
        for seed in 0..20 {
            let mut rng_a = StdRng::seed_from_u64(seed);
            let mut rng_b = StdRng::seed_from_u64(seed);
            let mut choices_a = HashMap::new();
            let mut choices_b = HashMap::new();
            let mut ctx_a = RenderContext {
                now,
                utc: true,
                rng: &mut rng_a,
                choices: &mut choices_a,
                host: &host,
            };
            let mut ctx_b = RenderContext {
                now,
                utc: true,
                rng: &mut rng_b,
                choices: &mut choices_b,
                host: &host,
            };
            assert_eq!(
                single.realize_line(0, &mut ctx_a),
                multi.realize_line(0, &mut ctx_b)
            );
        }
    }

    #[test]
    fn test_bad_random_token_disables_sample() {
        let cfg = Config::from_yaml(
            r#"
samples:
  - name: bad
    endIntervals: 1
    tokens:
      - name: n
        type: random
        replacement: int
        lower: 10
        upper: 5
    lines:
      - _raw: $n$
"#,
        )
        .unwrap();
        let output = OutputConfig::default();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        assert!(matches!(
            Sample::build(&cfg.samples[0], &ctx),
            Err(SampleError::BadToken { .. })
        ));
    }

    #[test]
    fn test_replay_offsets() {
        // Timestamps at +0, +1, +6, +16, +36 seconds.
        let sample = simple_sample(
            r#"
samples:
  - name: replaytest
    generator: replay
    tokens:
      - name: ts
        type: timestamp
        format: regex
        token: (\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})
        replacement: "%Y-%m-%d %H:%M:%S"
    lines:
      - _raw: 2001-10-20 12:00:00 line1
      - _raw: 2001-10-20 12:00:01 line2
      - _raw: 2001-10-20 12:00:06 line3
      - _raw: 2001-10-20 12:00:16 line4
      - _raw: 2001-10-20 12:00:36 line5
"#,
        );
        let offsets = &sample.replay_offsets;
        assert_eq!(offsets[1], Duration::seconds(1));
        assert_eq!(offsets[2], Duration::seconds(5));
        assert_eq!(offsets[3], Duration::seconds(10));
        assert_eq!(offsets[4], Duration::seconds(20));
        // Mean of 1, 5, 10, 20.
        assert_eq!(offsets[0], Duration::seconds(9));
    }

    #[test]
    fn test_replay_unparseable_timestamp_disables_sample() {
        let cfg = Config::from_yaml(
            r#"
samples:
  - name: badreplay
    generator: replay
    tokens:
      - name: ts
        type: timestamp
        format: regex
        token: (\d+:\d+)
        replacement: "%Y-%m-%d %H:%M:%S"
    lines:
      - _raw: "12:00 line1"
"#,
        )
        .unwrap();
        let output = OutputConfig::default();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        assert!(matches!(
            Sample::build(&cfg.samples[0], &ctx),
            Err(SampleError::ReplayIndex { .. })
        ));
    }

    #[test]
    fn test_token_table_resolution_from_other_sample() {
        let mut cfg = Config::from_yaml(
            r#"
samples:
  - name: main
    endIntervals: 1
    tokens:
      - name: user
        type: choice
        sample: users.sample
    lines:
      - _raw: user=$user$
"#,
        )
        .unwrap();
        cfg.samples.push(crate::config::SampleConfig {
            name: "users.sample".to_string(),
            disabled: true,
            lines: vec![
                HashMap::from([("_raw".to_string(), "alice".to_string())]),
                HashMap::from([("_raw".to_string(), "bob".to_string())]),
            ],
            ..Default::default()
        });

        let output = OutputConfig::default();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        let sample = Sample::build(&cfg.samples[0], &ctx).unwrap();
        match &sample.tokens[0].kind {
            TokenKind::Choice(items) => assert_eq!(items, &vec!["alice".to_string(), "bob".to_string()]),
            other => panic!("expected choice, got {other:?}"),
        }
    }

    #[test]
    fn test_system_time_token_injected_for_hec() {
        let mut output = OutputConfig::default();
        output.output_template = "splunkhec".to_string();
        let cfg = Config::from_yaml(
            r#"
samples:
  - name: hec
    endIntervals: 1
    lines:
      - _raw: hello
"#,
        )
        .unwrap();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        let sample = Sample::build(&cfg.samples[0], &ctx).unwrap();

        let time_tok = sample.tokens.iter().find(|t| t.name == "_time").unwrap();
        assert!(matches!(time_tok.kind, TokenKind::EpochTimestamp));
        assert_eq!(time_tok.group, TIMESTAMP_GROUP);
        assert_eq!(sample.lines[0]["_time"], "$_time$");
    }

    #[test]
    fn test_weighted_choice_from_config() {
        let mut cfg = Config::from_yaml(
            r#"
samples:
  - name: weighted
    endIntervals: 1
    tokens:
      - name: t
        type: weightedChoice
    lines:
      - _raw: $t$
"#,
        )
        .unwrap();
        cfg.samples[0].tokens[0].weighted_choice = vec![WeightedChoiceConfig {
            weight: 3,
            choice: "New".to_string(),
        }];
        let output = OutputConfig::default();
        let raters = cfg.rater_registry();
        let generators = cfg.generator_registry();
        let tables = cfg.sample_tables();
        let ctx = build_ctx(&output, &raters, &generators, &tables);
        let sample = Sample::build(&cfg.samples[0], &ctx).unwrap();
        assert!(matches!(&sample.tokens[0].kind, TokenKind::WeightedChoice(e) if e.len() == 1));
    }
}
