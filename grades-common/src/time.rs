//! Timestamp utilities
//!
//! Timestamps are persisted as RFC 3339 UTC strings with a fixed microsecond
//! precision so that string comparison in SQL matches chronological order.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};

/// Get current UTC timestamp, truncated to the persisted precision
pub fn now() -> DateTime<Utc> {
    truncate(Utc::now())
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Drop sub-microsecond precision so a value survives a database round trip unchanged
pub fn truncate(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.timestamp_subsec_nanos();
    ts - chrono::Duration::nanoseconds((nanos % 1_000) as i64)
}

/// Format a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format an optional timestamp for storage
pub fn opt_to_db(ts: Option<&DateTime<Utc>>) -> Option<String> {
    ts.map(to_db)
}

/// Parse a stored timestamp
pub fn from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

/// Parse an optional stored timestamp
pub fn opt_from_db(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(from_db).transpose()
}
