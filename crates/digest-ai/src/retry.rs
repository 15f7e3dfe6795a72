//! Backoff and retry decisions for provider requests.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;

const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_DOUBLINGS: usize = 6;

static REQUEST_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Retry limits shared by the chat and embedding endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    /// Total time budget for retries; `0` disables the budget.
    pub retry_budget_ms: u64,
    /// Randomize each delay within [50%, 100%] of the exponential backoff.
    pub retry_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_budget_ms: 0,
            retry_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, or `None` when the request should fail now.
    ///
    /// A `retry_after_ms` hint from the provider acts as a floor on the delay.
    pub fn delay_before_retry(
        &self,
        attempt: usize,
        elapsed_ms: u64,
        retry_after_ms: Option<u64>,
    ) -> Option<u64> {
        if attempt >= self.max_retries {
            return None;
        }
        let mut delay_ms = backoff_ms(attempt);
        if self.retry_jitter {
            delay_ms = rand::thread_rng().gen_range(delay_ms / 2..=delay_ms);
        }
        if let Some(floor_ms) = retry_after_ms {
            delay_ms = delay_ms.max(floor_ms);
        }
        let within_budget = self.retry_budget_ms == 0
            || elapsed_ms.saturating_add(delay_ms) <= self.retry_budget_ms;
        within_budget.then_some(delay_ms)
    }
}

pub(crate) fn backoff_ms(attempt: usize) -> u64 {
    BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(MAX_BACKOFF_DOUBLINGS))
}

/// Throttling, conflicts, timeouts and server errors are worth another attempt.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 409 | 425 | 429) || status.is_server_error()
}

pub(crate) fn is_transient_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

/// Parses `retry-after` as delta seconds or an HTTP date.
pub(crate) fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let remaining_ms = (retry_at - Utc::now()).num_milliseconds();
    Some(u64::try_from(remaining_ms).unwrap_or(0))
}

/// Correlation id sent with every provider request.
pub(crate) fn next_request_id() -> String {
    let sequence = REQUEST_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("digest-{}-{sequence}", Utc::now().timestamp_millis())
}
