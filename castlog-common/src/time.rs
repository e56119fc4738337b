//! Millisecond-based timing helpers
//!
//! All timestamps are stored in the database as i64 milliseconds since the
//! Unix epoch, and all duration math is done in integer milliseconds.
//! Outward-facing durations are minutes with one decimal place; truncation
//! happens only at display time so rounding error never compounds across
//! aggregation.

use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds per minute
pub const MS_PER_MINUTE: i64 = 60_000;

/// Current wall-clock time as epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a chrono timestamp to epoch milliseconds
pub fn datetime_to_ms(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert epoch milliseconds back to a chrono timestamp
///
/// Values outside chrono's representable range saturate to the epoch.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Convert whole minutes to milliseconds
pub fn minutes_to_ms(minutes: i64) -> i64 {
    minutes * MS_PER_MINUTE
}

/// Format a millisecond duration as minutes with one decimal place.
///
/// Truncating, not rounding: 89_999 ms renders as `1.4`, not `1.5`.
///
/// # Examples
///
/// ```
/// use castlog_common::time::format_minutes;
///
/// assert_eq!(format_minutes(0), "0.0");
/// assert_eq!(format_minutes(90_000), "1.5");
/// assert_eq!(format_minutes(89_999), "1.4");
/// assert_eq!(format_minutes(3_600_000), "60.0");
/// ```
pub fn format_minutes(ms: i64) -> String {
    let tenths = ms.max(0) / (MS_PER_MINUTE / 10);
    format!("{}.{}", tenths / 10, tenths % 10)
}
