//! Timestamp normalization for header dates.
//!
//! Downstream clients receive strict JSON text, so dates must be ISO-8601
//! strings. Kernels normally send RFC 3339 already; other representations
//! are converted where their meaning is unambiguous.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

/// Normalize a header `date` value in place.
///
/// - RFC 3339 strings are left untouched
/// - RFC 2822 strings are rewritten as RFC 3339 UTC
/// - numbers are read as Unix epoch seconds
/// - anything else is left as-is
pub fn normalize(value: &mut Value) {
    let normalized = match value {
        Value::String(text) => {
            if DateTime::parse_from_rfc3339(text).is_ok() {
                return;
            }
            match DateTime::parse_from_rfc2822(text) {
                Ok(date) => to_iso(date.with_timezone(&Utc)),
                Err(_) => return,
            }
        }
        Value::Number(number) => match number.as_f64().and_then(from_epoch_seconds) {
            Some(date) => to_iso(date),
            None => return,
        },
        _ => return,
    };
    *value = Value::String(normalized);
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let micros = (((seconds - whole) * 1_000_000.0).round() as u32).min(999_999);
    DateTime::from_timestamp(whole as i64, micros * 1_000)
}

fn to_iso(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Micros, true)
}
