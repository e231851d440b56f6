//! Payload decoding and validation.
//!
//! Pure functions from raw stream payloads to `Event`s. Every failure is a
//! `DecodeError`, which the worker treats as permanent: the entry is logged and
//! acknowledged so it cannot block the entries behind it.

use crate::error::DecodeError;
use crate::models::{Event, LogEntry};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

/// Offset-bearing layouts tried after RFC 3339. `%z` accepts `+hhmm` and `+hh:mm`.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"];

/// Layouts without an offset; these are read as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Decode one log entry.
pub fn decode_entry(entry: &LogEntry) -> Result<Event, DecodeError> {
    match &entry.payload {
        Some(bytes) => decode_payload(bytes),
        None => Err(DecodeError::MissingPayload),
    }
}

/// Decode a raw JSON payload into an `Event`.
pub fn decode_payload(bytes: &[u8]) -> Result<Event, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let user_id = parse_user_id(required(&mut object, "user_id")?)?;

    let timestamp = match required(&mut object, "timestamp")? {
        Value::String(raw) => parse_timestamp(&raw)?,
        other => {
            return Err(DecodeError::InvalidField {
                field: "timestamp",
                reason: format!("expected string, got {}", type_name(&other)),
            })
        }
    };

    let metadata = match required(&mut object, "metadata")? {
        Value::Object(map) if contains_nul(&map) => {
            return Err(DecodeError::InvalidField {
                field: "metadata",
                reason: "contains a U+0000 character".to_string(),
            })
        }
        Value::Object(map) => map,
        other => {
            return Err(DecodeError::InvalidField {
                field: "metadata",
                reason: format!("expected object, got {}", type_name(&other)),
            })
        }
    };

    Ok(Event::new(user_id, timestamp, metadata))
}

/// Parse an ISO-8601 timestamp into UTC.
///
/// Accepts RFC 3339 (`Z` or numeric offset), offsets without a colon, a space
/// in place of `T`, optional fractional seconds, naive date-times and bare
/// dates (with or without an offset). Values without an offset are taken to
/// be UTC. Instants PostgreSQL cannot store are rejected.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DecodeError> {
    let normalized = normalize_timestamp(raw);
    match parse_normalized(&normalized) {
        Some(ts) if ts >= min_storable() => Ok(ts),
        _ => Err(DecodeError::InvalidTimestamp(raw.to_string())),
    }
}

fn parse_normalized(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
}

/// Lower bound of `TIMESTAMPTZ` (4714-11-24 BC). The upper bound, year 294276,
/// lies past anything chrono can represent.
fn min_storable() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(-4713, 11, 24)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Trim, turn a trailing `Z` into `+00:00`, and use `T` as the date/time
/// separator. A bare date followed by an offset gets a midnight time.
fn normalize_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    let mut s = match trimmed.strip_suffix(|c: char| c == 'Z' || c == 'z') {
        Some(head) => format!("{}+00:00", head),
        None => trimmed.to_string(),
    };
    if s.len() > 10 {
        match s.as_bytes()[10] {
            b' ' => s.replace_range(10..11, "T"),
            b'+' | b'-' => s.insert_str(10, "T00:00:00"),
            _ => {}
        }
    }
    s
}

/// JSONB cannot hold U+0000 in keys or strings.
fn contains_nul(map: &Map<String, Value>) -> bool {
    fn value_has_nul(value: &Value) -> bool {
        match value {
            Value::String(s) => s.contains('\0'),
            Value::Array(items) => items.iter().any(value_has_nul),
            Value::Object(map) => contains_nul(map),
            _ => false,
        }
    }

    map.iter()
        .any(|(key, value)| key.contains('\0') || value_has_nul(value))
}

fn required(object: &mut Map<String, Value>, field: &'static str) -> Result<Value, DecodeError> {
    match object.remove(field) {
        None | Some(Value::Null) => Err(DecodeError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn parse_user_id(value: Value) -> Result<i64, DecodeError> {
    let invalid = |reason: String| DecodeError::InvalidField {
        field: "user_id",
        reason,
    };

    match value {
        Value::Number(n) => {
            if let Some(id) = n.as_i64() {
                return Ok(id);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(invalid(format!("{} is not a 64-bit integer", n))),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| invalid(format!("`{}` is not an integer", s))),
        other => Err(invalid(format!("expected integer, got {}", type_name(&other)))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
