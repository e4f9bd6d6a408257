//! Timestamp helpers.
//!
//! All persisted timestamps are UTC and use the `%Y-%m-%d %H:%M:%SZ` layout.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Layout used by the roster file.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

/// Current UTC time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp in the roster layout.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp in the roster layout.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether two timestamps fall on the same calendar date.
pub fn same_date(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.date_naive() == b.date_naive()
}

/// `HH:MM:SS` rendering of an elapsed number of seconds.
pub fn format_elapsed(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
