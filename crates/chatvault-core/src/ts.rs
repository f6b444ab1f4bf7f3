//! Slack timestamp helpers.
//!
//! Slack identifies messages by a string timestamp `"<secs>.<micros>"`.
//! Comparing those strings lexically breaks once the seconds part changes
//! width, so every ordering decision goes through [`to_micros`].

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

/// Parse `"1700000000.000100"` into microseconds since the epoch.
///
/// A missing fractional part is accepted (`"1700000000"`), and a fraction
/// shorter than six digits is right-padded.
pub fn to_micros(ts: &str) -> Result<i64> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    if secs.is_empty() || frac.len() > 6 {
        bail!("invalid slack timestamp: {:?}", ts);
    }
    let secs: i64 = secs
        .parse()
        .with_context(|| format!("invalid slack timestamp: {:?}", ts))?;
    let mut micros: i64 = 0;
    if !frac.is_empty() {
        let digits: i64 = frac
            .parse()
            .with_context(|| format!("invalid slack timestamp: {:?}", ts))?;
        micros = digits * 10i64.pow(6 - frac.len() as u32);
    }
    secs.checked_mul(1_000_000)
        .and_then(|s| s.checked_add(micros))
        .with_context(|| format!("slack timestamp out of range: {:?}", ts))
}

/// Format microseconds as a Slack timestamp.
pub fn from_micros(micros: i64) -> String {
    format!("{}.{:06}", micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
}

pub fn to_datetime(ts: &str) -> Result<DateTime<Utc>> {
    let micros = to_micros(ts)?;
    DateTime::from_timestamp_micros(micros)
        .with_context(|| format!("timestamp out of range: {:?}", ts))
}

pub fn from_datetime(dt: &DateTime<Utc>) -> String {
    from_micros(dt.timestamp_micros())
}

/// Calendar day (UTC) of a message, used for the per-day export files.
pub fn day(ts: &str) -> Result<String> {
    Ok(to_datetime(ts)?.format("%Y-%m-%d").to_string())
}

/// Ordering key that sorts unparseable timestamps first instead of failing.
pub fn sort_key(ts: &str) -> i64 {
    to_micros(ts).unwrap_or(i64::MIN)
}

/// Returns the later of two timestamps.
pub fn max<'a>(a: &'a str, b: &'a str) -> &'a str {
    if sort_key(b) > sort_key(a) {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_partial() {
        assert_eq!(to_micros("1700000000.000100").unwrap(), 1_700_000_000_000_100);
        assert_eq!(to_micros("1700000000").unwrap(), 1_700_000_000_000_000);
        assert_eq!(to_micros("5.5").unwrap(), 5_500_000);
        assert!(to_micros("").is_err());
        assert!(to_micros("abc.1").is_err());
        assert!(to_micros("1.1234567").is_err());
    }

    #[test]
    fn oversized_seconds_are_rejected() {
        assert!(to_micros("9223372036854775807.000000").is_err());
        assert!(to_micros("9223372036855.000000").is_err());
        assert_eq!(sort_key("9223372036855.000000"), i64::MIN);
    }

    #[test]
    fn format_is_inverse() {
        let ts = "1700000000.000100";
        assert_eq!(from_micros(to_micros(ts).unwrap()), ts);
    }

    #[test]
    fn numeric_not_lexical_order() {
        assert_eq!(max("999999999.000000", "1000000000.000000"), "1000000000.000000");
        assert!(sort_key("9.0") < sort_key("10.0"));
    }

    #[test]
    fn day_is_utc() {
        assert_eq!(day("1700000000.000100").unwrap(), "2023-11-14");
    }
}
