use crate::constants::HTTP_TIMEOUT;
use crate::error::Result;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

const USER_AGENT: &str = concat!("release-notify/", env!("CARGO_PKG_VERSION"));

/// One pooled client per adapter; every request gets the shared timeout.
pub fn build_http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()?;
    Ok(client)
}

/// `Retry-After` in delta-seconds form. HTTP dates are not used by the
/// providers we talk to.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Transport failures worth another try on a later run.
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// First 200 characters of a response body, for error messages.
pub fn body_snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(42)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_body_snippet_cuts_on_char_boundary() {
        assert_eq!(body_snippet("short"), "short");
        let long = "频".repeat(300);
        assert_eq!(body_snippet(&long).chars().count(), 200);
    }
}
