//! Serde helpers for human-readable durations (`"30s"`, `"1m 30s"`).
//!
//! Use with `#[serde(with = "tether_core::duration")]`. Plain integers are
//! read as seconds.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Text(String),
    Secs(u64),
}

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Text(text) => humantime::parse_duration(text.trim())
            .map_err(|e| serde::de::Error::custom(format!("invalid duration '{}': {}", text, e))),
        RawDuration::Secs(secs) => Ok(Duration::from_secs(secs)),
    }
}
