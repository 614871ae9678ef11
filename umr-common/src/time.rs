//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Format used for archive file stems (second granularity)
pub const STEM_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp as a file-name-safe stem, e.g. `20251119_120530`
pub fn timestamp_stem(ts: &DateTime<Utc>) -> String {
    ts.format(STEM_FORMAT).to_string()
}
