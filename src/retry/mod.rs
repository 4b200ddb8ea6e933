// Retry-hint parsing: extracts a wait duration from the three shapes the
// upstream and OAuth endpoints hand back, plus the retryable-status check.
// Covers the RetryInfo `<float>s` form, the ErrorInfo `quotaResetDelay`
// form, and the plain HTTP `Retry-After` header (seconds or HTTP-date).

use tracing::debug;

/// Google's `RetryInfo.retryDelay` duration string, e.g. `"0.457639761s"` or
/// `"40s"`. Returns milliseconds, capped at 60s per the Gemini CLI's own
/// handling of this field.
pub fn parse_retry_delay_seconds(duration_str: &str) -> Option<i64> {
    let seconds_str = duration_str.strip_suffix('s')?;
    let seconds: f64 = seconds_str.parse().ok()?;
    let capped = seconds.min(60.0).max(0.0);
    Some((capped * 1000.0) as i64)
}

/// Google's `ErrorInfo.metadata.quotaResetDelay` duration string, e.g.
/// `"2m30.5s"` or `"45s"` (minutes component optional). Returns milliseconds.
pub fn parse_quota_reset_delay(duration_str: &str) -> Option<i64> {
    let (minutes, rest) = match duration_str.split_once('m') {
        Some((m, rest)) => (m.parse::<i64>().ok()?, rest),
        None => (0, duration_str),
    };
    let seconds_str = rest.strip_suffix('s')?;
    let seconds: f64 = seconds_str.parse().ok()?;
    Some(minutes * 60_000 + (seconds * 1000.0) as i64)
}

/// HTTP `Retry-After` header value: either an integer count of seconds or an
/// HTTP-date (RFC 1123, as used by `httpdate`/RFC 7231 §7.1.1.1). Returns
/// milliseconds from now; a date already in the past yields `0`.
pub fn parse_retry_after_header(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Some(seconds.max(0) * 1000);
    }

    let parsed = chrono::DateTime::parse_from_rfc2822(trimmed)
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(trimmed))
        .ok()?;
    let now = chrono::Utc::now();
    let diff_ms = parsed.with_timezone(&chrono::Utc).signed_duration_since(now).num_milliseconds();
    Some(diff_ms.max(0))
}

/// Determine if an HTTP status code is retryable in the upstream retry loop.
pub fn is_retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Best-effort extraction of `retry_after_ms` for a 429, trying the header
/// first, then the two JSON body shapes, logging which source won.
pub fn extract_retry_after_ms(header: Option<&str>, body: &str) -> Option<i64> {
    if let Some(h) = header {
        if let Some(ms) = parse_retry_after_header(h) {
            debug!(ms, "retry_after from HTTP header");
            return Some(ms);
        }
    }
    if let Some(ms) = crate::scheduler::retry_after_ms_from_error_body(body) {
        debug!(ms, "retry_after from response body");
        return Some(ms);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_info_seconds_and_caps_at_sixty() {
        assert_eq!(parse_retry_delay_seconds("0.457639761s"), Some(457));
        assert_eq!(parse_retry_delay_seconds("40s"), Some(40_000));
        assert_eq!(parse_retry_delay_seconds("120s"), Some(60_000));
    }

    #[test]
    fn parses_quota_reset_delay_with_and_without_minutes() {
        assert_eq!(parse_quota_reset_delay("2m30.5s"), Some(150_500));
        assert_eq!(parse_quota_reset_delay("45s"), Some(45_000));
        assert_eq!(parse_quota_reset_delay("0m5s"), Some(5_000));
    }

    #[test]
    fn parses_retry_after_header_seconds_form() {
        assert_eq!(parse_retry_after_header("120"), Some(120_000));
        assert_eq!(parse_retry_after_header("0"), Some(0));
    }

    #[test]
    fn parses_retry_after_header_http_date_form() {
        let future = chrono::Utc::now() + chrono::Duration::seconds(30);
        let header = future.to_rfc2822();
        let ms = parse_retry_after_header(&header).unwrap();
        // allow scheduling jitter in the test itself
        assert!((28_000..=31_000).contains(&ms), "got {ms}");
    }

    #[test]
    fn retryable_statuses_match_spec_set() {
        assert!(is_retryable(429));
        assert!(is_retryable(500));
        assert!(is_retryable(502));
        assert!(is_retryable(503));
        assert!(is_retryable(504));
        assert!(!is_retryable(400));
        assert!(!is_retryable(404));
    }
}
