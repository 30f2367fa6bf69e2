//! RFC 1123 `Last-Modified` handling.

use chrono::{DateTime, Utc};

/// Format seconds-since-epoch as an RFC 1123 UTC date, the way HTTP wants it
/// (`Thu, 02 Jan 2020 03:04:05 GMT`).
pub fn format_http_date(secs: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an HTTP date back into seconds-since-epoch. RFC 2822 parsing covers
/// the RFC 1123 form, including the obsolete `GMT` zone name.
pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.timestamp())
}
