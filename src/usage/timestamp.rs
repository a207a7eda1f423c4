//! Reset-time parsing.
//!
//! Formats are tried in order and the first match wins. Anything that
//! matches none of them is treated as an unknown reset time.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Offset-carrying formats tried after RFC 3339.
const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.3f%z", "%Y-%m-%dT%H:%M:%S%z"];

/// Legacy formats without an offset. Interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%a %b %e %H:%M:%S %Y"];

/// Parses a provider reset timestamp.
///
/// Order: RFC 3339 (with or without fractional seconds), ISO 8601 with a
/// numeric offset, then the legacy naive formats.
pub fn parse_reset_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    for format in OFFSET_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(raw, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
