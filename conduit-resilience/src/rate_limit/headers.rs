//! Server-reported rate limit headers

use http::HeaderMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const REMAINING: &str = "x-ratelimit-remaining";
const LIMIT: &str = "x-ratelimit-limit";
const RESET_AFTER: &str = "x-ratelimit-reset-after";
const RESET: &str = "x-ratelimit-reset";
const BUCKET: &str = "x-ratelimit-bucket";
const GLOBAL: &str = "x-ratelimit-global";

/// Rate limit state as reported by a server response
///
/// Every field is optional because servers report different subsets;
/// absent fields leave the corresponding bucket state untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    /// Time until the bucket resets
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_headers_at(headers, SystemTime::now())
    }

    /// Parse headers, resolving absolute `x-ratelimit-reset` against `now`
    pub fn from_headers_at(headers: &HeaderMap, now: SystemTime) -> Self {
        let reset_after = header_str(headers, RESET_AFTER)
            .and_then(parse_seconds)
            .or_else(|| {
                let reset = header_str(headers, RESET).and_then(parse_seconds)?;
                let reset_at = UNIX_EPOCH.checked_add(reset)?;
                Some(reset_at.duration_since(now).unwrap_or(Duration::ZERO))
            });

        Self {
            remaining: header_str(headers, REMAINING).and_then(|v| v.parse().ok()),
            limit: header_str(headers, LIMIT).and_then(|v| v.parse().ok()),
            reset_after,
            bucket: header_str(headers, BUCKET)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            global: header_str(headers, GLOBAL)
                .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1"),
        }
    }

    /// Whether the response carried any rate limit information
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}

// Whole or fractional seconds; negative and non-finite values are rejected
fn parse_seconds(value: &str) -> Option<Duration> {
    let seconds: f64 = value.parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
