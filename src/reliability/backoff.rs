use rand::Rng;
use std::time::Duration;

/// Signature shared by backoff strategies so the retrying client can be
/// configured with another one.
pub type BackoffFn = fn(Duration, Duration, u32, Option<&ResponseInfo>) -> Duration;

/// The parts of an HTTP response the retry machinery looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseInfo {
    pub status: u16,
    pub retry_after: Option<Duration>,
}

impl ResponseInfo {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn from_response(response: &reqwest::Response) -> Self {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        Self {
            status: response.status().as_u16(),
            retry_after,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429 || self.status == 503
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Longest `Retry-After` hint a server can impose.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Parses a `Retry-After` header given in whole seconds, clamped to
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Delay before retry number `attempt` (zero based).
///
/// A rate-limited response (429 or 503) carrying `Retry-After` waits for that
/// hint (at most [`MAX_RETRY_AFTER`]) plus up to 25% jitter and is not
/// capped by `max`. Otherwise the delay is
/// `min * 2^attempt` plus up to 25% jitter. `max` caps the exponential term
/// and then the jittered sum, so the result never exceeds `max`; while the
/// exponential term is below `max` the result lies in
/// `[min * 2^attempt, min(1.25 * min * 2^attempt, max)]`.
pub fn exponential_backoff_with_jitter(
    min: Duration,
    max: Duration,
    attempt: u32,
    response: Option<&ResponseInfo>,
) -> Duration {
    if let Some(response) = response
        && response.is_rate_limited()
        && let Some(retry_after) = response.retry_after
    {
        let retry_after = retry_after.min(MAX_RETRY_AFTER);
        return retry_after.saturating_add(jitter_up_to(retry_after / 4));
    }

    let exponential = 2u32
        .checked_pow(attempt)
        .and_then(|factor| min.checked_mul(factor))
        .map_or(max, |delay| delay.min(max));
    if exponential >= max {
        return max;
    }

    exponential
        .saturating_add(jitter_up_to(exponential / 4))
        .min(max)
}

fn jitter_up_to(limit: Duration) -> Duration {
    let nanos = u64::try_from(limit.as_nanos()).unwrap_or(u64::MAX);
    if nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..=nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(2);
    const MAX: Duration = Duration::from_secs(60);

    #[test]
    fn stays_within_jitter_band_below_max() {
        for attempt in 0..=20u32 {
            let exponential = MIN.checked_mul(2u32.pow(attempt)).unwrap();
            for _ in 0..50 {
                let delay = exponential_backoff_with_jitter(MIN, MAX, attempt, None);
                if exponential < MAX {
                    assert!(delay >= exponential, "attempt {attempt}: {delay:?}");
                    assert!(
                        delay <= exponential.mul_f64(1.25),
                        "attempt {attempt}: {delay:?}"
                    );
                }
                assert!(delay <= MAX, "attempt {attempt}: {delay:?}");
            }
        }
    }

    #[test]
    fn cap_applies_after_jitter() {
        // 2s * 2^4 = 32s; jitter could push it to 40s but max is 35s.
        let max = Duration::from_secs(35);
        for _ in 0..200 {
            let delay = exponential_backoff_with_jitter(MIN, max, 4, None);
            assert!(delay >= Duration::from_secs(32));
            assert!(delay <= max);
        }
    }

    #[test]
    fn saturates_at_max_for_huge_attempts() {
        assert_eq!(exponential_backoff_with_jitter(MIN, MAX, 40, None), MAX);
        assert_eq!(exponential_backoff_with_jitter(MIN, MAX, u32::MAX, None), MAX);
    }

    #[test]
    fn honors_retry_after_when_rate_limited() {
        let hint = Duration::from_secs(90);
        for status in [429, 503] {
            let response = ResponseInfo::new(status).with_retry_after(hint);
            let delay = exponential_backoff_with_jitter(MIN, MAX, 0, Some(&response));
            assert!(delay >= hint);
            assert!(delay <= hint.mul_f64(1.25));
        }
    }

    #[test]
    fn huge_retry_after_is_clamped() {
        let hint = parse_retry_after("18446744073709551615").unwrap();
        assert_eq!(hint, MAX_RETRY_AFTER);

        let response = ResponseInfo::new(429).with_retry_after(Duration::MAX);
        let delay = exponential_backoff_with_jitter(MIN, MAX, 0, Some(&response));
        assert!(delay >= MAX_RETRY_AFTER);
        assert!(delay <= MAX_RETRY_AFTER.mul_f64(1.25));
    }

    #[test]
    fn huge_bounds_do_not_overflow() {
        let delay = exponential_backoff_with_jitter(Duration::MAX / 4, Duration::MAX, 0, None);
        assert!(delay >= Duration::MAX / 4);
        assert!(delay <= Duration::MAX);
    }

    #[test]
    fn ignores_retry_after_on_other_statuses() {
        let response = ResponseInfo::new(500).with_retry_after(Duration::from_secs(90));
        let delay = exponential_backoff_with_jitter(MIN, MAX, 0, Some(&response));
        assert!(delay >= MIN && delay <= MIN.mul_f64(1.25));
    }

    #[test]
    fn rate_limited_without_hint_falls_back_to_exponential() {
        let response = ResponseInfo::new(429);
        let delay = exponential_backoff_with_jitter(MIN, MAX, 1, Some(&response));
        assert!(delay >= Duration::from_secs(4) && delay <= Duration::from_secs(5));
    }

    #[test]
    fn parses_retry_after_seconds_only() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after("-1"), None);
    }
}
