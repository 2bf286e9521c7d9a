//! Event-rate shaping.
//!
//! A rater maps `(sample, now, base count)` to the number of events a
//! scheduler tick should produce. Misconfiguration degrades to the identity
//! rater; raters never signal errors.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, warn};

use crate::sample::Sample;
use crate::script::ScriptHost;

/// The rate-shaping variants.
#[derive(Debug, Clone, Default)]
pub enum RaterSpec {
    /// Identity.
    #[default]
    Default,
    /// Product of per-hour, per-minute, and per-weekday multipliers looked up
    /// against the wall-clock components of `now`. Missing buckets count as 1.
    Config {
        hour_of_day: HashMap<u32, f64>,
        minute_of_hour: HashMap<u32, f64>,
        day_of_week: HashMap<u32, f64>,
    },
    /// Shapes the count so the expected byte rate matches a kB/s target.
    Kbps { kbps: f64 },
    /// Delegates to the script host.
    Script { script: String },
}

impl RaterSpec {
    /// The rate multiplier at `now`, without sample context. `Kbps` needs the
    /// sample's mean event size and degrades to 1 here; use [`event_rate`]
    /// for the full computation.
    pub fn multiplier(&self, now: DateTime<Utc>, host: &dyn ScriptHost) -> f64 {
        match self {
            RaterSpec::Default => 1.0,
            RaterSpec::Config {
                hour_of_day,
                minute_of_hour,
                day_of_week,
            } => {
                let local = now.with_timezone(&Local);
                let h = hour_of_day.get(&local.hour()).copied().unwrap_or(1.0);
                let m = minute_of_hour.get(&local.minute()).copied().unwrap_or(1.0);
                let d = day_of_week
                    .get(&local.weekday().num_days_from_sunday())
                    .copied()
                    .unwrap_or(1.0);
                h * m * d
            }
            RaterSpec::Kbps { .. } => 1.0,
            RaterSpec::Script { script } => match host.event_rate(script, now, 0) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "script rater failed, using identity rate");
                    1.0
                }
            },
        }
    }
}

/// Compute the shaped event count for one scheduler tick.
///
/// The rater produces a multiplier, `randomizeCount` applies symmetric
/// jitter, and the result rounds half away from zero.
pub fn event_rate(
    sample: &Sample,
    spec: &RaterSpec,
    now: DateTime<Utc>,
    count: i64,
    rng: &mut StdRng,
    host: &dyn ScriptHost,
) -> i64 {
    let mut rate = match spec {
        RaterSpec::Kbps { kbps } => {
            let avg = sample.avg_event_bytes.max(1.0);
            let desired = kbps * 1024.0 * sample.interval as f64 / avg;
            if count > 0 {
                desired / count as f64
            } else {
                desired
            }
        }
        RaterSpec::Script { script } => match host.event_rate(script, now, count) {
            Ok(r) => r,
            Err(e) => {
                warn!(sample = %sample.name, error = %e, "script rater failed, using identity rate");
                1.0
            }
        },
        other => other.multiplier(now, host),
    };

    let mut jitter = 1.0;
    if sample.randomize_count != 0.0 {
        let half = sample.randomize_count / 2.0;
        jitter = 1.0 + rng.gen_range(-half..half);
        rate *= jitter;
    }

    let rated = rate * count as f64;
    let ret = if rated < 0.0 {
        (rated - 0.5).ceil() as i64
    } else {
        (rated + 0.5).floor() as i64
    };
    debug!(
        sample = %sample.name,
        count = ret,
        rated_count = rated,
        orig_count = count,
        jitter,
        "rated event count"
    );
    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::NullScriptHost;
    use rand::SeedableRng;

    fn bare_sample(randomize_count: f64) -> Sample {
        let mut s = Sample::empty("ratertest");
        s.randomize_count = randomize_count;
        s.interval = 1;
        s
    }

    #[test]
    fn test_default_rater_is_identity() {
        let s = bare_sample(0.0);
        let mut rng = StdRng::seed_from_u64(7);
        for n in [0, 1, 5, 1000] {
            assert_eq!(
                event_rate(&s, &RaterSpec::Default, Utc::now(), n, &mut rng, &NullScriptHost),
                n
            );
        }
    }

    #[test]
    fn test_randomize_count_is_deterministic_with_seed() {
        let s = bare_sample(0.2);
        let now = Utc::now();
        let a = event_rate(
            &s,
            &RaterSpec::Default,
            now,
            1000,
            &mut StdRng::seed_from_u64(99),
            &NullScriptHost,
        );
        let b = event_rate(
            &s,
            &RaterSpec::Default,
            now,
            1000,
            &mut StdRng::seed_from_u64(99),
            &NullScriptHost,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_randomize_count_mean_stays_near_base() {
        let s = bare_sample(0.2);
        let now = Utc::now();
        let mut rng = StdRng::seed_from_u64(12345);
        let n = 1000i64;
        let draws = 10_000;
        let total: i64 = (0..draws)
            .map(|_| event_rate(&s, &RaterSpec::Default, now, n, &mut rng, &NullScriptHost))
            .sum();
        let mean = total as f64 / draws as f64;
        assert!(
            (mean - n as f64).abs() / n as f64 <= 0.01,
            "mean {mean} deviates more than 1% from {n}"
        );
    }

    #[test]
    fn test_config_rater_missing_buckets_are_identity() {
        let spec = RaterSpec::Config {
            hour_of_day: HashMap::new(),
            minute_of_hour: HashMap::new(),
            day_of_week: HashMap::new(),
        };
        assert_eq!(spec.multiplier(Utc::now(), &NullScriptHost), 1.0);
    }

    #[test]
    fn test_config_rater_multiplies_buckets() {
        let now = Utc::now();
        let local = now.with_timezone(&Local);
        let spec = RaterSpec::Config {
            hour_of_day: HashMap::from([(local.hour(), 2.0)]),
            minute_of_hour: HashMap::from([(local.minute(), 0.5)]),
            day_of_week: HashMap::new(),
        };
        assert_eq!(spec.multiplier(now, &NullScriptHost), 1.0 * 2.0 * 0.5);
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        let s = bare_sample(0.0);
        let mut rng = StdRng::seed_from_u64(1);
        // Config rater with a 0.5 multiplier on every bucket over count 1
        // rates to 0.5, which rounds up to 1.
        let now = Utc::now();
        let local = now.with_timezone(&Local);
        let spec = RaterSpec::Config {
            hour_of_day: HashMap::from([(local.hour(), 0.5)]),
            minute_of_hour: HashMap::new(),
            day_of_week: HashMap::new(),
        };
        assert_eq!(event_rate(&s, &spec, now, 1, &mut rng, &NullScriptHost), 1);
    }
}
