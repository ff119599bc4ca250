use std::time::{SystemTime, UNIX_EPOCH};

/// `YYYYMMDDHHMMSS` in UTC, used for log and snapshot file names.
pub fn compact_timestamp(at: SystemTime) -> String {
    humantime::format_rfc3339_seconds(at)
        .to_string()
        .chars()
        .filter(char::is_ascii_digit)
        .collect()
}

/// `YYYY-MM-DD` in UTC.
pub fn date_stamp(at: SystemTime) -> String {
    let mut text = humantime::format_rfc3339_seconds(at).to_string();
    text.truncate(10);
    text
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
