//! Shared timestamp helpers: UTC instants at 100 ns tick resolution.
//!
//! Ticks count 100 ns intervals since `0001-01-01T00:00:00Z`, which keeps change-file names
//! compatible with replicas that stamp them from a .NET-style clock.

use crate::core::error::CairnError;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};

pub const TICKS_PER_SECOND: i64 = 10_000_000;
pub const TICKS_PER_MILLISECOND: i64 = 10_000;
const NANOS_PER_TICK: u32 = 100;
/// Ticks between `0001-01-01` and the unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Current instant, truncated to tick resolution so it survives a text round trip.
pub fn now() -> DateTime<Utc> {
    truncate_to_tick(Utc::now())
}

pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn truncate_to_tick(t: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = t.nanosecond();
    t.with_nanosecond(nanos - nanos % NANOS_PER_TICK).unwrap_or(t)
}

pub fn to_ticks(t: &DateTime<Utc>) -> i64 {
    t.timestamp() * TICKS_PER_SECOND
        + i64::from(t.timestamp_subsec_nanos() / NANOS_PER_TICK)
        + UNIX_EPOCH_TICKS
}

pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let rel = ticks - UNIX_EPOCH_TICKS;
    let secs = rel.div_euclid(TICKS_PER_SECOND);
    let nanos = (rel.rem_euclid(TICKS_PER_SECOND) as u32) * NANOS_PER_TICK;
    DateTime::from_timestamp(secs, nanos)
}

pub fn add_ticks(t: &DateTime<Utc>, ticks: i64) -> DateTime<Utc> {
    from_ticks(to_ticks(t) + ticks).unwrap_or(*t)
}

/// ISO-8601 with a `Z` suffix and the shortest exact fractional part.
pub fn format_iso(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_iso(s: &str) -> Result<DateTime<Utc>, CairnError> {
    DateTime::parse_from_rfc3339(s.trim())
        .map(|d| truncate_to_tick(d.with_timezone(&Utc)))
        .map_err(|e| CairnError::FormatError(format!("invalid timestamp '{}': {}", s, e)))
}

/// Short universal form used in audit notes, e.g. `2024-07-05 10:00:00Z`.
pub fn format_note_stamp(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%SZ").to_string()
}

/// Serde adapter for reserved timestamp fields.
pub mod iso {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(t: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_iso(t))
    }

    /// `null` reads as now, like a missing field.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::parse_iso(&raw).map_err(serde::de::Error::custom),
            None => Ok(super::now()),
        }
    }
}
