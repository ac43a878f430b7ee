//! Shared serialization helpers for human-readable durations and sizes.

use std::time::Duration;

/// Serde adapter for `Duration` fields expressed as strings like `"30s"`,
/// `"100ms"`, `"5m"` or `"1h"`.
pub mod duration_serde {
    use super::parse_duration;
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis();
        if millis % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", millis / 1000))
        } else {
            serializer.serialize_str(&format!("{millis}ms"))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        use serde::Deserialize;
        use serde_json::Value;

        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => parse_duration(&s).map_err(Error::custom),
            Value::Number(n) => {
                let secs = n
                    .as_u64()
                    .ok_or_else(|| Error::custom("duration must be a non-negative integer"))?;
                Ok(Duration::from_secs(secs))
            }
            _ => Err(Error::custom("invalid duration format")),
        }
    }
}

/// Serde adapter for `Option<Duration>` fields using the same string forms
/// as [`duration_serde`].
pub mod opt_duration_serde {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::duration_serde::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let value = Option::<String>::deserialize(deserializer)?;
        match value {
            Some(s) => parse_duration(&s).map(Some).map_err(Error::custom),
            None => Ok(None),
        }
    }
}

/// Parse a human duration string (`"250ms"`, `"30s"`, `"1.5s"`, `"10m"`, `"2h"`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('s') {
        let num: f64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        if num < 0.0 {
            return Err(format!("negative duration: {s}"));
        }
        return Ok(Duration::from_secs_f64(num));
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    // Bare numbers are seconds.
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| format!("invalid duration: {s}"))
}

/// Parse a memory size string into bytes.
///
/// Accepts Kubernetes-style binary suffixes (`"256Mi"`, `"1Gi"`, `"512Ki"`),
/// decimal suffixes (`"100M"`, `"1G"`, `"64K"`) and bare byte counts.
pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty memory size".to_string());
    }
    let (num_part, multiplier) = if let Some(n) = s.strip_suffix("Ki") {
        (n, 1024u64)
    } else if let Some(n) = s.strip_suffix("Mi") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("Gi") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1000)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1_000_000_000)
    } else {
        (s, 1)
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size: {s}"))?;
    Ok(num * multiplier)
}
