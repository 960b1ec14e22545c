//! `time` ↔ `chrono` conversions at the sqlx boundary.

use chrono::{DateTime, Utc};
use time::OffsetDateTime;

pub(crate) fn time_to_chrono(t: OffsetDateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(t.unix_timestamp(), t.nanosecond()).unwrap_or_else(Utc::now)
}

pub(crate) fn time_to_chrono_opt(t: Option<OffsetDateTime>) -> Option<DateTime<Utc>> {
    t.map(time_to_chrono)
}

pub(crate) fn chrono_to_time(t: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(t.timestamp())
        .map(|secs| secs + time::Duration::nanoseconds(i64::from(t.timestamp_subsec_nanos())))
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) fn chrono_to_time_opt(t: Option<DateTime<Utc>>) -> Option<OffsetDateTime> {
    t.map(chrono_to_time)
}
