use chrono::{DateTime, Duration, Utc};

/// Text format of every stored timestamp: naive UTC with microseconds.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Lower bound for "the last `hours` hours" history queries.
pub fn history_start(now: DateTime<Utc>, hours: u32) -> String {
    format_timestamp(now - Duration::hours(i64::from(hours)))
}
