//! Relative and absolute time-spec parsing.
//!
//! Sample configs describe points in time as either the literal `now`, a
//! signed duration relative to now (`-60s`, `+5m 30s`), or an absolute
//! timestamp (`2001-10-20T12:00:00`, with or without a zone). Naive
//! timestamps are interpreted in local time.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TimeSpecError {
    #[error("unparseable time spec '{0}'")]
    Unparseable(String),

    #[error("bad duration in time spec '{0}': {1}")]
    BadDuration(String, humantime::DurationError),
}

/// A point in time expressed relative to an as-yet-unknown "now".
#[derive(Debug, Clone, PartialEq)]
pub enum TimeSpec {
    /// The literal string `now`.
    Now,
    /// A signed offset from now.
    Relative(Duration),
    /// A fixed instant.
    Absolute(DateTime<Utc>),
}

/// Formats accepted for absolute, zone-less timestamps.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
];

impl TimeSpec {
    /// Parse a time spec string.
    pub fn parse(spec: &str) -> Result<Self, TimeSpecError> {
        let spec = spec.trim();
        if spec.is_empty() || spec == "now" {
            return Ok(TimeSpec::Now);
        }

        if let Some(rest) = spec.strip_prefix('-') {
            let d = humantime::parse_duration(rest.trim())
                .map_err(|e| TimeSpecError::BadDuration(spec.to_string(), e))?;
            let d = Duration::from_std(d).map_err(|_| TimeSpecError::Unparseable(spec.into()))?;
            return Ok(TimeSpec::Relative(-d));
        }
        if let Some(rest) = spec.strip_prefix('+') {
            let d = humantime::parse_duration(rest.trim())
                .map_err(|e| TimeSpecError::BadDuration(spec.to_string(), e))?;
            let d = Duration::from_std(d).map_err(|_| TimeSpecError::Unparseable(spec.into()))?;
            return Ok(TimeSpec::Relative(d));
        }

        // RFC3339 carries its own zone.
        if let Ok(t) = DateTime::parse_from_rfc3339(spec) {
            return Ok(TimeSpec::Absolute(t.with_timezone(&Utc)));
        }

        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(spec, fmt) {
                return Ok(TimeSpec::Absolute(local_to_utc(naive)));
            }
        }

        Err(TimeSpecError::Unparseable(spec.to_string()))
    }

    /// Resolve the spec against a concrete `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeSpec::Now => now,
            TimeSpec::Relative(d) => now + *d,
            TimeSpec::Absolute(t) => *t,
        }
    }

    /// The signed distance from `now` to the resolved instant.
    pub fn offset_from(&self, now: DateTime<Utc>) -> Duration {
        self.resolve(now) - now
    }
}

/// Interpret a naive timestamp as local wall-clock time.
pub fn local_to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t.with_timezone(&Utc),
        // DST gaps/folds: earliest mapping wins.
        chrono::LocalResult::Ambiguous(t, _) => t.with_timezone(&Utc),
        chrono::LocalResult::None => Utc.from_utc_datetime(&naive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_now() {
        assert_eq!(TimeSpec::parse("now").unwrap(), TimeSpec::Now);
        assert_eq!(TimeSpec::parse("").unwrap(), TimeSpec::Now);
    }

    #[test]
    fn test_parse_relative() {
        let spec = TimeSpec::parse("-60s").unwrap();
        assert_eq!(spec, TimeSpec::Relative(Duration::seconds(-60)));

        let spec = TimeSpec::parse("+5m").unwrap();
        assert_eq!(spec, TimeSpec::Relative(Duration::seconds(300)));
    }

    #[test]
    fn test_parse_absolute() {
        let spec = TimeSpec::parse("2001-10-20T12:00:00").unwrap();
        match spec {
            TimeSpec::Absolute(t) => {
                let local = t.with_timezone(&Local);
                assert_eq!(local.format("%Y-%m-%d %H:%M:%S").to_string(), "2001-10-20 12:00:00");
            }
            other => panic!("expected absolute, got {other:?}"),
        }
    }

    #[test]
    fn test_offset_from() {
        let now = Utc::now();
        let spec = TimeSpec::parse("-90s").unwrap();
        assert_eq!(spec.offset_from(now), Duration::seconds(-90));
        assert_eq!(TimeSpec::Now.offset_from(now), Duration::zero());
    }

    #[test]
    fn test_unparseable() {
        assert!(TimeSpec::parse("half past ten").is_err());
    }
}
