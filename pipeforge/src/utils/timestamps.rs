//! UTC timestamps and their integer encoding for durable storage.

use chrono::{DateTime, TimeZone, Utc};

/// Timestamp type used across the crate.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 string with microsecond precision.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Encodes a timestamp as microseconds since the Unix epoch.
#[must_use]
pub fn to_micros(ts: &Timestamp) -> i64 {
    ts.timestamp_micros()
}

/// Decodes microseconds since the Unix epoch. Returns `None` when out of range.
#[must_use]
pub fn from_micros(micros: i64) -> Option<Timestamp> {
    Utc.timestamp_micros(micros).single()
}
