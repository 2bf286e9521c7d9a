//! Token types and rendering.
//!
//! A token is a typed placeholder inside a sample line. At event time each
//! token renders to a concrete string: a random value, a table lookup, a
//! formatted timestamp, a scripted value, or a literal. Tokens locate
//! themselves in a field either by a literal marker (`$name$`) or by a regex
//! capture group.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use regex::Regex;
use thiserror::Error;
use uuid::Uuid;

use crate::rater::RaterSpec;
use crate::script::ScriptHost;

/// An event is a flat field-map.
pub type Event = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("field '{0}' missing from table row")]
    MissingSourceField(String),

    #[error("empty choice table")]
    EmptyTable,

    #[error("script evaluation failed: {0}")]
    Script(#[from] crate::script::ScriptError),
}

/// How a token locates its replacement span inside a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFormat {
    /// All occurrences of a literal marker substring.
    Template,
    /// The span of the first capture group of each regex match
    /// (whole match when the pattern has no groups).
    Regex,
}

/// Numeric/string shapes shared by `random` and `rated` tokens.
#[derive(Debug, Clone)]
pub enum RandomKind {
    Int { lower: i64, upper: i64 },
    Float { lower: f64, upper: f64, precision: usize },
    String { length: usize },
    Hex { length: usize },
    Guid,
    Ipv4,
    Ipv6,
}

/// One weighted entry of a `weightedChoice` table.
#[derive(Debug, Clone)]
pub struct WeightedEntry {
    pub weight: u32,
    pub choice: String,
}

/// The behavior variants of a token.
pub enum TokenKind {
    Random(RandomKind),
    /// A random value scaled by a rater's multiplier at event time.
    Rated { kind: RandomKind, rater: RaterSpec },
    Choice(Vec<String>),
    WeightedChoice(Vec<WeightedEntry>),
    /// Selects a row from a table and projects one column. Tokens sharing a
    /// positive `group` resolve against the same row.
    FieldChoice { rows: Vec<Event>, src_field: String },
    /// strftime-style timestamp of the event instant.
    Timestamp { format: String },
    /// Go reference-layout timestamp, converted to strftime at load.
    GoTimestamp { format: String },
    /// Epoch seconds with millisecond fraction.
    EpochTimestamp,
    /// Per-token script with persistent key/value state.
    Script {
        script: String,
        state: Mutex<HashMap<String, String>>,
    },
    /// Literal replacement.
    Static(String),
    /// Forwarder channel GUID drawn from a bounded pool.
    Channel { pool: Vec<String> },
}

impl std::fmt::Debug for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Random(k) => write!(f, "Random({k:?})"),
            TokenKind::Rated { kind, .. } => write!(f, "Rated({kind:?})"),
            TokenKind::Choice(c) => write!(f, "Choice({} items)", c.len()),
            TokenKind::WeightedChoice(c) => write!(f, "WeightedChoice({} items)", c.len()),
            TokenKind::FieldChoice { rows, src_field } => {
                write!(f, "FieldChoice({} rows, src {src_field})", rows.len())
            }
            TokenKind::Timestamp { format } => write!(f, "Timestamp({format})"),
            TokenKind::GoTimestamp { format } => write!(f, "GoTimestamp({format})"),
            TokenKind::EpochTimestamp => write!(f, "EpochTimestamp"),
            TokenKind::Script { .. } => write!(f, "Script"),
            TokenKind::Static(s) => write!(f, "Static({s})"),
            TokenKind::Channel { pool } => write!(f, "Channel({} channels)", pool.len()),
        }
    }
}

impl TokenKind {
    /// Whether this token renders the event's assigned instant.
    pub fn is_timestamp(&self) -> bool {
        matches!(
            self,
            TokenKind::Timestamp { .. } | TokenKind::GoTimestamp { .. } | TokenKind::EpochTimestamp
        )
    }
}

/// The group id reserved for system timestamp tokens.
pub const TIMESTAMP_GROUP: i32 = -1;

/// A fully resolved token.
#[derive(Debug)]
pub struct Token {
    pub name: String,
    /// The event field this token substitutes into.
    pub field: String,
    pub format: TokenFormat,
    /// Literal marker, e.g. `$host$`. Unused for regex format.
    pub marker: String,
    /// Compiled pattern for regex format.
    pub regex: Option<Regex>,
    /// Correlation group: positive groups share a table row,
    /// [`TIMESTAMP_GROUP`] marks system timestamps.
    pub group: i32,
    pub kind: TokenKind,
}

/// Everything a token render needs from its surroundings.
pub struct RenderContext<'a> {
    /// The instant assigned to the event under construction.
    pub now: DateTime<Utc>,
    /// Render timestamps in UTC instead of local time.
    pub utc: bool,
    pub rng: &'a mut StdRng,
    /// Shared row selections for positive-group tokens, threaded per line.
    pub choices: &'a mut HashMap<i32, usize>,
    pub host: &'a dyn ScriptHost,
}

impl Token {
    /// All replacement spans of this token within `value`, as `(start, end)`
    /// byte offsets. Empty when the token does not occur.
    pub fn offsets(&self, value: &str) -> Vec<(usize, usize)> {
        match self.format {
            TokenFormat::Template => value
                .match_indices(self.marker.as_str())
                .map(|(start, _)| (start, start + self.marker.len()))
                .collect(),
            TokenFormat::Regex => {
                let Some(re) = &self.regex else {
                    return Vec::new();
                };
                re.captures_iter(value)
                    .filter_map(|caps| {
                        let m = caps.get(1).or_else(|| caps.get(0))?;
                        Some((m.start(), m.end()))
                    })
                    .collect()
            }
        }
    }

    /// Render this token's replacement text.
    pub fn render(&self, ctx: &mut RenderContext<'_>) -> Result<String, TokenError> {
        match &self.kind {
            TokenKind::Random(kind) => Ok(render_random(kind, ctx.rng)),
            TokenKind::Rated { kind, rater } => {
                let mult = rater.multiplier(ctx.now, ctx.host);
                Ok(render_rated(kind, mult, ctx.rng))
            }
            TokenKind::Choice(items) => {
                if items.is_empty() {
                    return Err(TokenError::EmptyTable);
                }
                let idx = ctx.rng.gen_range(0..items.len());
                Ok(items[idx].clone())
            }
            TokenKind::WeightedChoice(items) => {
                let total: u32 = items.iter().map(|e| e.weight).sum();
                if total == 0 {
                    return Err(TokenError::EmptyTable);
                }
                let mut draw = ctx.rng.gen_range(0..total);
                for entry in items {
                    if draw < entry.weight {
                        return Ok(entry.choice.clone());
                    }
                    draw -= entry.weight;
                }
                Ok(items[items.len() - 1].choice.clone())
            }
            TokenKind::FieldChoice { rows, src_field } => {
                if rows.is_empty() {
                    return Err(TokenError::EmptyTable);
                }
                let idx = if self.group > 0 {
                    match ctx.choices.get(&self.group) {
                        Some(&idx) => idx,
                        None => {
                            let idx = ctx.rng.gen_range(0..rows.len());
                            ctx.choices.insert(self.group, idx);
                            idx
                        }
                    }
                } else {
                    ctx.rng.gen_range(0..rows.len())
                };
                rows[idx]
                    .get(src_field)
                    .cloned()
                    .ok_or_else(|| TokenError::MissingSourceField(src_field.clone()))
            }
            TokenKind::Timestamp { format } | TokenKind::GoTimestamp { format } => {
                Ok(format_instant(ctx.now, ctx.utc, format))
            }
            TokenKind::EpochTimestamp => Ok(format_epoch(ctx.now)),
            TokenKind::Script { script, state } => {
                let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
                Ok(ctx.host.eval_token(script, &mut state, ctx.now)?)
            }
            TokenKind::Static(replacement) => Ok(replacement.clone()),
            TokenKind::Channel { pool } => {
                if pool.is_empty() {
                    return Err(TokenError::EmptyTable);
                }
                let idx = ctx.rng.gen_range(0..pool.len());
                Ok(pool[idx].clone())
            }
        }
    }

    /// Parse `value` as the instant this timestamp token would have rendered.
    /// Only meaningful for timestamp-family tokens; used to index replay
    /// samples at load.
    pub fn parse_timestamp(&self, value: &str) -> Option<DateTime<Utc>> {
        match &self.kind {
            TokenKind::Timestamp { format } | TokenKind::GoTimestamp { format } => {
                if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
                    return Some(crate::timespec::local_to_utc(naive));
                }
                // Layouts carrying a zone parse as offset datetimes.
                DateTime::parse_from_str(value, format)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
            TokenKind::EpochTimestamp => {
                let secs: f64 = value.parse().ok()?;
                let nanos = ((secs.fract()) * 1e9).round() as u32;
                Utc.timestamp_opt(secs.trunc() as i64, nanos).single()
            }
            _ => None,
        }
    }
}

fn render_random(kind: &RandomKind, rng: &mut StdRng) -> String {
    match kind {
        RandomKind::Int { lower, upper } => {
            if lower >= upper {
                lower.to_string()
            } else {
                rng.gen_range(*lower..*upper).to_string()
            }
        }
        RandomKind::Float {
            lower,
            upper,
            precision,
        } => {
            let v = lower + rng.gen::<f64>() * (upper - lower);
            format!("{:.*}", *precision, v)
        }
        RandomKind::String { length } => rng
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(*length)
            .map(char::from)
            .collect(),
        RandomKind::Hex { length } => {
            const HEX: &[u8] = b"0123456789abcdef";
            (0..*length)
                .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
                .collect()
        }
        RandomKind::Guid => Uuid::new_v4().to_string(),
        RandomKind::Ipv4 => {
            let octets: Vec<String> = (0..4).map(|_| rng.gen_range(0..256u16).to_string()).collect();
            octets.join(".")
        }
        RandomKind::Ipv6 => {
            let groups: Vec<String> = (0..8).map(|_| format!("{:x}", rng.gen::<u16>())).collect();
            groups.join(":")
        }
    }
}

fn render_rated(kind: &RandomKind, multiplier: f64, rng: &mut StdRng) -> String {
    match kind {
        RandomKind::Int { lower, upper } => {
            let base = if lower >= upper {
                *lower
            } else {
                rng.gen_range(*lower..*upper)
            };
            ((base as f64 * multiplier).round() as i64).to_string()
        }
        RandomKind::Float {
            lower,
            upper,
            precision,
        } => {
            let v = (lower + rng.gen::<f64>() * (upper - lower)) * multiplier;
            format!("{:.*}", *precision, v)
        }
        other => render_random(other, rng),
    }
}

/// Format an instant with a strftime-style format in the configured zone.
pub fn format_instant(now: DateTime<Utc>, utc: bool, format: &str) -> String {
    if utc {
        now.format(format).to_string()
    } else {
        now.with_timezone(&Local).format(format).to_string()
    }
}

/// Epoch seconds with three fractional digits, e.g. `1003561200.000`.
pub fn format_epoch(now: DateTime<Utc>) -> String {
    format!("{}.{:03}", now.timestamp(), now.timestamp_subsec_millis())
}

/// Translate the supported non-chrono aliases (`%L` for milliseconds) into
/// chrono specifiers.
pub fn normalize_strftime(format: &str) -> String {
    format.replace("%L", "%3f")
}

/// Ordered Go reference-layout fragments and their strftime equivalents.
/// Longest fragments first so `January` wins over `Jan` and `2006` over `06`.
const GO_LAYOUT_MAP: &[(&str, &str)] = &[
    ("January", "%B"),
    ("Monday", "%A"),
    (".000000000", "%.9f"),
    (".999999999", "%.f"),
    (".000000", "%.6f"),
    (".999999", "%.f"),
    ("Z07:00", "%:z"),
    ("-07:00", "%:z"),
    ("2006", "%Y"),
    ("Z0700", "%z"),
    ("-0700", "%z"),
    (".000", "%.3f"),
    (".999", "%.f"),
    ("Jan", "%b"),
    ("Mon", "%a"),
    ("MST", "%Z"),
    ("15", "%H"),
    ("01", "%m"),
    ("02", "%d"),
    ("_2", "%e"),
    ("03", "%I"),
    ("04", "%M"),
    ("05", "%S"),
    ("06", "%y"),
    ("PM", "%p"),
    ("pm", "%P"),
];

/// Convert a Go reference-time layout (`2006-01-02 15:04:05.000`) to a
/// strftime format string.
pub fn go_layout_to_strftime(layout: &str) -> String {
    let mut out = String::with_capacity(layout.len() + 8);
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (go, strf) in GO_LAYOUT_MAP {
            if let Some(tail) = rest.strip_prefix(go) {
                out.push_str(strf);
                rest = tail;
                continue 'outer;
            }
        }
        let ch = rest.chars().next().unwrap();
        if ch == '%' {
            out.push_str("%%");
        } else {
            out.push(ch);
        }
        rest = &rest[ch.len_utf8()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn template_token(name: &str, kind: TokenKind) -> Token {
        Token {
            name: name.to_string(),
            field: "_raw".to_string(),
            format: TokenFormat::Template,
            marker: format!("${name}$"),
            regex: None,
            group: 0,
            kind,
        }
    }

    fn ctx_parts() -> (StdRng, HashMap<i32, usize>) {
        (StdRng::seed_from_u64(42), HashMap::new())
    }

    #[test]
    fn test_template_offsets() {
        let t = template_token("host", TokenKind::Static("h".into()));
        let offsets = t.offsets("a $host$ b $host$");
        assert_eq!(offsets, vec![(2, 8), (11, 17)]);
    }

    #[test]
    fn test_regex_offsets_capture_group() {
        let t = Token {
            name: "transtype".into(),
            field: "_raw".into(),
            format: TokenFormat::Regex,
            marker: String::new(),
            regex: Some(Regex::new(r"transType=(\w+)").unwrap()),
            group: 0,
            kind: TokenKind::Static("New".into()),
        };
        let offsets = t.offsets("x transType=Change y");
        assert_eq!(offsets, vec![(12, 18)]);
    }

    #[test]
    fn test_random_int_in_range() {
        let (mut rng, mut choices) = ctx_parts();
        let host = crate::script::NullScriptHost;
        let t = template_token("n", TokenKind::Random(RandomKind::Int { lower: 5, upper: 10 }));
        for _ in 0..100 {
            let mut ctx = RenderContext {
                now: Utc::now(),
                utc: true,
                rng: &mut rng,
                choices: &mut choices,
                host: &host,
            };
            let v: i64 = t.render(&mut ctx).unwrap().parse().unwrap();
            assert!((5..10).contains(&v));
        }
    }

    #[test]
    fn test_field_choice_group_cohesion() {
        let rows = vec![
            HashMap::from([("city".to_string(), "BOSTON".to_string()), ("zip".to_string(), "2123".to_string())]),
            HashMap::from([("city".to_string(), "HARTFORD".to_string()), ("zip".to_string(), "6101".to_string())]),
        ];
        let city = Token {
            group: 1,
            ..template_token(
                "city",
                TokenKind::FieldChoice { rows: rows.clone(), src_field: "city".into() },
            )
        };
        let zip = Token {
            group: 1,
            ..template_token("zip", TokenKind::FieldChoice { rows: rows.clone(), src_field: "zip".into() })
        };

        let host = crate::script::NullScriptHost;
        let (mut rng, _) = ctx_parts();
        for _ in 0..50 {
            let mut choices = HashMap::new();
            let mut ctx = RenderContext {
                now: Utc::now(),
                utc: true,
                rng: &mut rng,
                choices: &mut choices,
                host: &host,
            };
            let c = city.render(&mut ctx).unwrap();
            let z = zip.render(&mut ctx).unwrap();
            let row = rows.iter().find(|r| r["city"] == c).unwrap();
            assert_eq!(row["zip"], z, "grouped tokens must project the same row");
        }
    }

    #[test]
    fn test_epoch_format() {
        let t = Utc.with_ymd_and_hms(2001, 10, 20, 7, 0, 0).unwrap();
        assert_eq!(format_epoch(t), "1003561200.000");
    }

    #[test]
    fn test_go_layout_conversion() {
        assert_eq!(go_layout_to_strftime("2006-01-02 15:04:05.000"), "%Y-%m-%d %H:%M:%S%.3f");
        assert_eq!(go_layout_to_strftime("Jan _2 15:04:05"), "%b %e %H:%M:%S");
        assert_eq!(
            go_layout_to_strftime("2006-01-02T15:04:05.999999Z07:00"),
            "%Y-%m-%dT%H:%M:%S%.f%:z"
        );
    }

    #[test]
    fn test_normalize_strftime() {
        assert_eq!(normalize_strftime("%H:%M:%S:%L"), "%H:%M:%S:%3f");
    }

    #[test]
    fn test_parse_epoch_timestamp() {
        let t = template_token("ts", TokenKind::EpochTimestamp);
        let parsed = t.parse_timestamp("1003561200.500").unwrap();
        assert_eq!(parsed.timestamp(), 1003561200);
        assert_eq!(parsed.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn test_weighted_choice_respects_weights() {
        let (mut rng, mut choices) = ctx_parts();
        let host = crate::script::NullScriptHost;
        let t = template_token(
            "w",
            TokenKind::WeightedChoice(vec![
                WeightedEntry { weight: 0, choice: "never".into() },
                WeightedEntry { weight: 5, choice: "always".into() },
            ]),
        );
        for _ in 0..50 {
            let mut ctx = RenderContext {
                now: Utc::now(),
                utc: true,
                rng: &mut rng,
                choices: &mut choices,
                host: &host,
            };
            assert_eq!(t.render(&mut ctx).unwrap(), "always");
        }
    }
}
