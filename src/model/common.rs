use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Row ids are database-assigned integers. Branches refer to deploys only
/// through these ids, never through owned values.
pub type Id = i64;

pub type Timestamp = DateTime<Utc>;

/// Fresh directory name for a deploy tree
pub fn generate_dir_name() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn now() -> Timestamp {
    Utc::now()
}

/// IMF-fixdate as used by `Last-Modified` / `If-Modified-Since`
pub fn http_date(ts: &Timestamp) -> String {
    ts.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(value: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
