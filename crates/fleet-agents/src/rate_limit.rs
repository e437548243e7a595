//! Rate-limit signatures in worker output.
//!
//! Only consulted after a worker exits non-zero; a limited worker usually
//! prints something like `Limit reached · resets 5pm (Europe/Berlin)` or
//! `429 Too Many Requests, retry after 120 seconds` and stops.

use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use regex::Regex;

/// What the detector found in a worker's output tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// The line that matched a signature.
    pub matched: String,
    pub reset_at: DateTime<Utc>,
    /// `false` when `reset_at` comes from the fallback window.
    pub explicit_reset: bool,
}

pub struct RateLimitDetector {
    signature: Regex,
    reset_clock: Regex,
    reset_timestamp: Regex,
    retry_after: Regex,
    fallback: Duration,
}

impl RateLimitDetector {
    pub fn new(fallback: Duration) -> Result<Self, regex::Error> {
        Ok(Self {
            signature: Regex::new(
                r"(?i)(rate[ _-]?limit|usage limit|limit reached|too many requests|quota exceeded|(?:status|http|error)\D{0,4}429\b)",
            )?,
            reset_clock: Regex::new(r"(?i)\bresets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b")?,
            reset_timestamp: Regex::new(
                r"(?i)\breset(?:s|_at|s_at)?[\s:=\x22']+(?:at\s+)?(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:\d{2}))",
            )?,
            retry_after: Regex::new(
                r"(?i)\b(?:retry|try again)[\s-]+(?:after|in)\s+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m|hours?|hrs?|h)?\b",
            )?,
            fallback,
        })
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }

    pub fn is_rate_limited(&self, output: &str) -> bool {
        self.signature.is_match(output)
    }

    /// Look for a signature and, if found, work out when the limit resets.
    ///
    /// `now` carries the local zone so that wall-clock resets such as
    /// `resets 5pm` resolve to the next such time in that zone.
    pub fn detect<Tz: TimeZone>(&self, output: &str, now: &DateTime<Tz>) -> Option<RateLimitSignal> {
        let matched = output
            .lines()
            .rev()
            .find(|line| self.signature.is_match(line))?
            .trim()
            .to_string();

        let explicit = self.parse_reset(output, now);
        let now_utc = now.with_timezone(&Utc);
        let reset_at = explicit.unwrap_or_else(|| {
            now_utc + ChronoDuration::from_std(self.fallback).unwrap_or_else(|_| ChronoDuration::hours(5))
        });
        tracing::debug!(%reset_at, explicit = explicit.is_some(), "rate-limit signature detected");
        Some(RateLimitSignal {
            matched,
            reset_at,
            explicit_reset: explicit.is_some(),
        })
    }

    /// Extract an explicit reset time. The last mention in the output wins.
    pub fn parse_reset<Tz: TimeZone>(&self, output: &str, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        for line in output.lines().rev() {
            if let Some(at) = self.parse_reset_line(line, now) {
                return Some(at);
            }
        }
        None
    }

    fn parse_reset_line<Tz: TimeZone>(&self, line: &str, now: &DateTime<Tz>) -> Option<DateTime<Utc>> {
        if let Some(caps) = self.reset_timestamp.captures(line) {
            if let Ok(at) = DateTime::parse_from_rfc3339(&caps[1]) {
                return Some(at.with_timezone(&Utc));
            }
        }

        if let Some(caps) = self.retry_after.captures(line) {
            let amount: i64 = caps[1].parse().ok()?;
            let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
            let delta = match unit.as_deref().and_then(|u| u.chars().next()) {
                Some('m') => ChronoDuration::minutes(amount),
                Some('h') => ChronoDuration::hours(amount),
                _ => ChronoDuration::seconds(amount),
            };
            return Some(now.with_timezone(&Utc) + delta);
        }

        if let Some(caps) = self.reset_clock.captures(line) {
            let hour: u32 = caps[1].parse().ok()?;
            let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
            if !(1..=12).contains(&hour) || minute > 59 {
                return None;
            }
            let pm = caps[3].eq_ignore_ascii_case("pm");
            let hour24 = match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, false) => h,
                (h, true) => h + 12,
            };
            return next_occurrence(now, NaiveTime::from_hms_opt(hour24, minute, 0)?);
        }

        None
    }
}

/// The next instant strictly after `now` whose wall-clock time in `now`'s zone
/// is `time`.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, time: NaiveTime) -> Option<DateTime<Utc>> {
    let tz = now.timezone();
    let today = now.date_naive();
    for offset in 0..=2 {
        let day = today + ChronoDuration::days(offset);
        let Some(candidate) = tz.from_local_datetime(&day.and_time(time)).earliest() else {
            continue;
        };
        if candidate > *now {
            return Some(candidate.with_timezone(&Utc));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    fn detector() -> RateLimitDetector {
        RateLimitDetector::new(Duration::from_secs(5 * 3600)).unwrap()
    }

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn recognises_common_signatures() {
        let d = detector();
        for text in [
            "Claude AI usage limit reached|1760000000",
            "5-hour limit reached · resets 5pm",
            "Error: rate_limit_error",
            "API Error: 429 Too Many Requests",
            "request failed with status 429",
            "Quota exceeded for this organization",
        ] {
            assert!(d.is_rate_limited(text), "{text}");
        }
    }

    #[test]
    fn ordinary_failures_are_not_rate_limits() {
        let d = detector();
        for text in ["error: could not compile", "processed 429 files", "panicked at src/main.rs:429"] {
            assert!(!d.is_rate_limited(text), "{text}");
        }
    }

    #[test]
    fn clock_reset_later_today() {
        let now = at("2026-03-02T10:15:00+01:00");
        let signal = detector().detect("Limit reached · resets 5pm (Europe/Berlin)", &now).unwrap();
        assert!(signal.explicit_reset);
        assert_eq!(signal.reset_at, at("2026-03-02T17:00:00+01:00").with_timezone(&Utc));
    }

    #[test]
    fn clock_reset_already_passed_rolls_to_tomorrow() {
        let now = at("2026-03-02T18:00:00+00:00");
        let reset = detector().parse_reset("usage limit reached, resets at 11:30am", &now).unwrap();
        assert_eq!(reset, at("2026-03-03T11:30:00+00:00").with_timezone(&Utc));
    }

    #[test]
    fn twelve_am_is_midnight() {
        let now = at("2026-03-02T18:00:00+00:00");
        let reset = detector().parse_reset("resets 12am", &now).unwrap();
        assert_eq!(reset, at("2026-03-03T00:00:00+00:00").with_timezone(&Utc));
    }

    #[test]
    fn retry_after_seconds_and_minutes() {
        let now = at("2026-03-02T10:00:00+00:00");
        let d = detector();
        assert_eq!(
            d.parse_reset("429 Too Many Requests, retry after 120 seconds", &now).unwrap(),
            at("2026-03-02T10:02:00+00:00").with_timezone(&Utc)
        );
        assert_eq!(
            d.parse_reset("rate limited; try again in 15 minutes", &now).unwrap(),
            at("2026-03-02T10:15:00+00:00").with_timezone(&Utc)
        );
    }

    #[test]
    fn explicit_timestamp() {
        let now = at("2026-03-02T10:00:00+00:00");
        let reset = detector()
            .parse_reset(r#"{"error":"rate_limit","reset_at":"2026-03-02T14:00:00Z"}"#, &now)
            .unwrap();
        assert_eq!(reset, at("2026-03-02T14:00:00+00:00").with_timezone(&Utc));
    }

    #[test]
    fn fallback_window_when_no_reset_given() {
        let now = at("2026-03-02T10:00:00+00:00");
        let signal = detector().detect("some output\nToo many requests\n", &now).unwrap();
        assert!(!signal.explicit_reset);
        assert_eq!(signal.matched, "Too many requests");
        assert_eq!(signal.reset_at, at("2026-03-02T15:00:00+00:00").with_timezone(&Utc));
    }

    #[test]
    fn no_signature_no_signal() {
        let now = Utc::now();
        assert!(detector().detect("retry after 5 seconds\nsegfault", &now).is_none());
    }
}
