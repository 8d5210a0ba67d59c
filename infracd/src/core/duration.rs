//! Human-readable durations for configuration values.
//!
//! Accepts a bare number of seconds (`90`) or one or more `<number><unit>`
//! segments (`30s`, `5m`, `1h30m`, `250ms`, `2d`).

use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Parse a duration string like "30s", "5m" or "1h30m" into a Duration.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(format!("invalid number in duration: {s}"));
        }
        let num: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid number in duration: {s}"))?;
        rest = &rest[digits_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let segment = match rest[..unit_end].trim() {
            "ms" => Duration::from_millis(num),
            "s" | "sec" | "secs" => Duration::from_secs(num),
            "m" | "min" | "mins" => Duration::from_secs(num.saturating_mul(60)),
            "h" | "hr" | "hrs" => Duration::from_secs(num.saturating_mul(3600)),
            "d" | "day" | "days" => Duration::from_secs(num.saturating_mul(86_400)),
            "" => return Err(format!("missing duration unit in: {s}")),
            other => return Err(format!("unknown duration suffix: {other}")),
        };
        total = total.saturating_add(segment);
        rest = &rest[unit_end..];
    }
    Ok(total)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

impl RawDuration {
    fn into_duration(self) -> Result<Duration, String> {
        match self {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(text) => parse_duration(&text),
        }
    }
}

/// `#[serde(deserialize_with = "...")]` helper for `Duration` fields.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    RawDuration::deserialize(deserializer)?
        .into_duration()
        .map_err(serde::de::Error::custom)
}

/// `#[serde(deserialize_with = "...")]` helper for `Option<Duration>` fields.
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<RawDuration>::deserialize(deserializer)?
        .map(RawDuration::into_duration)
        .transpose()
        .map_err(serde::de::Error::custom)
}
