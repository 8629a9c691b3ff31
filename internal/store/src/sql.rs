//! Helpers for types that don't natively implement ToSql.
//!
//! Times are stored as milliseconds since the Unix epoch. Times before the
//! epoch are clamped to it, since nothing we record predates 1970.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub(crate) fn from_time(time: &SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub(crate) fn into_time(timestamp: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(timestamp.max(0) as u64)
}

pub(crate) fn from_opt_time(time: Option<&SystemTime>) -> Option<i64> {
    time.map(from_time)
}

pub(crate) fn into_opt_time(timestamp: Option<i64>) -> Option<SystemTime> {
    timestamp.map(into_time)
}
