//! Timestamp helpers shared by the registry, database, and worker ticks.
//!
//! Every persisted or wire-serialized timestamp in this crate is an ISO-8601
//! string. The registry's latest-activity merge relies on lexicographic
//! ordering of these strings, which `chrono`'s RFC 3339 output satisfies as
//! long as all timestamps share the same UTC offset and fractional precision.

use chrono::{DateTime, Utc};

/// The current instant, formatted as RFC 3339 in UTC with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Format an arbitrary instant the same way `now_iso` does.
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Convert a `SystemTime` (as returned by filesystem metadata) to the same
/// ISO-8601 representation.
pub fn system_time_to_iso(t: std::time::SystemTime) -> String {
    to_iso(DateTime::<Utc>::from(t))
}
