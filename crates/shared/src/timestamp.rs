//! Message timestamps arrive as RFC 3339 strings from the relay and as epoch
//! milliseconds (number or numeric string) from the persistence collaborator.

use chrono::{DateTime, TimeZone, Utc};
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value;

pub fn parse(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok()
            .or_else(|| text.parse::<i64>().ok().and_then(from_millis)),
        Value::Number(number) => number.as_i64().and_then(from_millis),
        _ => None,
    }
}

pub fn from_millis(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// `deserialize_with` target accepting any form [`parse`] understands.
pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| D::Error::custom(format!("unsupported timestamp {raw}")))
}

#[cfg(test)]
#[path = "tests/timestamp_tests.rs"]
mod tests;
