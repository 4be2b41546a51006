use anyhow::{Result, anyhow};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

pub(crate) const RATE_LIMIT_MAX_RETRIES: usize = 5;
pub(crate) const RATE_LIMIT_BASE_DELAY: Duration = Duration::from_secs(2);
pub(crate) const RATE_LIMIT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Sends the request built by `build`, retrying rate-limited responses with
/// exponential backoff. Returns the body of the first successful response.
pub(crate) async fn send_with_retry<B>(
    provider: &str,
    build: B,
    extract_error: fn(&str) -> Option<String>,
) -> Result<String>
where
    B: Fn() -> RequestBuilder,
{
    let mut attempt = 0usize;
    let mut delay = RATE_LIMIT_BASE_DELAY;
    loop {
        attempt += 1;
        let response = build()
            .send()
            .await
            .map_err(|err| anyhow!("{} request failed: {}", provider, err))?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            return Ok(text);
        }
        if is_rate_limited(status, &text) && attempt < RATE_LIMIT_MAX_RETRIES {
            delay = wait_with_backoff(provider, attempt, delay, retry_after).await;
            continue;
        }
        return Err(anyhow!(
            "{} API error ({}): {}",
            provider,
            status,
            extract_error(&text).unwrap_or(text)
        ));
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if matches!(status.as_u16(), 503 | 529) {
        return true;
    }
    let lower = body.to_lowercase();
    [
        "rate limit",
        "rate_limit",
        "too many requests",
        "resource_exhausted",
        "overloaded",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

async fn wait_with_backoff(
    provider: &str,
    attempt: usize,
    delay: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    let wait = retry_after.map_or(delay, |value| value.max(delay));
    warn!(
        "{} rate limited; retrying in {:.1}s (attempt {}/{})",
        provider,
        wait.as_secs_f32(),
        attempt,
        RATE_LIMIT_MAX_RETRIES
    );
    sleep(wait).await;
    next_delay(delay)
}

pub(crate) fn next_delay(current: Duration) -> Duration {
    current
        .saturating_mul(2)
        .max(RATE_LIMIT_BASE_DELAY)
        .min(RATE_LIMIT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn detects_rate_limits_by_status_and_body() {
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(is_rate_limited(StatusCode::SERVICE_UNAVAILABLE, ""));
        assert!(is_rate_limited(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
        ));
        assert!(!is_rate_limited(StatusCode::UNAUTHORIZED, "invalid api key"));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(next_delay(Duration::from_secs(2)), Duration::from_secs(4));
        assert_eq!(next_delay(Duration::ZERO), RATE_LIMIT_BASE_DELAY);
        assert_eq!(next_delay(Duration::from_secs(45)), RATE_LIMIT_MAX_DELAY);
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static(" 12 "));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(12)));
    }
}
