//! HTTP-date helpers (IMF-fixdate, always GMT).

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::{Error, Result};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats a unix timestamp for a `Date` header.
pub fn http_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Current time formatted for a `Date` header.
pub fn date_time_string() -> String {
    http_date(Utc::now().timestamp())
}

pub fn parse_http_date(value: &str) -> Result<i64> {
    NaiveDateTime::parse_from_str(value.trim(), HTTP_DATE_FORMAT)
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|e| Error::parse(format!("invalid HTTP date {:?}: {}", value, e)))
}
