use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::driver::AbortHandle;
use crate::errors::StreamError;

/// Backoff schedule for reopening a stream that failed before delivering
/// anything. Applied at the call boundary, never inside the stream driver.
///
/// Delays are kept in milliseconds so the policy reads cleanly from JSON or
/// env-driven config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Reopen attempts after the first request.
    pub retries: u32,
    pub base_delay_ms: u64,
    /// Growth per reopen; values below 1.0 are treated as 1.0.
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 10_000;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl RetryPolicy {
    /// Single attempt, no reopen.
    pub const fn disabled() -> Self {
        Self {
            retries: 0,
            base_delay_ms: BASE_DELAY_MS,
            multiplier: 2.0,
            max_delay_ms: MAX_DELAY_MS,
        }
    }

    /// Doubling backoff starting at `base_delay`.
    pub fn backoff(retries: u32, base_delay: Duration) -> Self {
        Self {
            retries,
            base_delay_ms: base_delay.as_millis() as u64,
            ..Self::disabled()
        }
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    /// Total requests including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done < self.retries
    }

    /// Delay before reopen number `retries_done + 1`.
    pub fn delay_for(&self, retries_done: u32) -> Duration {
        let growth = self.multiplier.max(1.0).powi(retries_done.min(32) as i32);
        let scaled = (self.base_delay_ms as f64 * growth).min(u64::MAX as f64) as u64;
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }
}

/// Sleeps for a retry backoff unless the caller aborts first.
pub(crate) async fn backoff_or_abort(
    delay: Duration,
    abort: Option<&AbortHandle>,
) -> Result<(), StreamError> {
    match abort {
        Some(abort) => tokio::select! {
            biased;
            _ = abort.aborted() => Err(StreamError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Re-invokes `op` with a fresh attempt number until it succeeds, fails with a
/// non-retryable error, or the policy is exhausted.
pub async fn retry_async<T, F, Fut>(
    policy: &RetryPolicy,
    abort: Option<&AbortHandle>,
    mut op: F,
) -> Result<T, StreamError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StreamError>>,
{
    let mut retries_done = 0u32;
    loop {
        let attempt = retries_done + 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let can_retry = err.is_retryable() && policy.allows_retry(retries_done);
                debug!(
                    event = "retry.attempt_failed",
                    domain = "retry",
                    attempt,
                    code = err.code(),
                    can_retry,
                    error = %err
                );
                if !can_retry {
                    return Err(err);
                }
                let backoff = policy.delay_for(retries_done);
                info!(
                    event = "retry.scheduled",
                    domain = "retry",
                    attempt,
                    next_attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64
                );
                backoff_or_abort(backoff, abort).await?;
                retries_done += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn disabled_policy_makes_one_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.allows_retry(0));
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = RetryPolicy::backoff(4, Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        let delays: Vec<u128> = (0..4).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 350, 350]);
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let policy = RetryPolicy::backoff(2, Duration::from_millis(40)).multiplier(0.5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(40));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"retries":3}"#).expect("policy");
        assert_eq!(policy.retries, 3);
        assert_eq!(policy.base_delay_ms, 500);
        assert_eq!(policy.max_delay_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_errors_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::backoff(3, Duration::from_millis(10));
        let result = retry_async(&policy, None, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(StreamError::status(503, "busy"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::backoff(5, Duration::from_millis(10));
        let result: Result<(), _> = retry_async(&policy, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StreamError::status(400, "bad request")) }
        })
        .await;
        assert!(matches!(result, Err(StreamError::Status { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn abort_during_backoff_cancels() {
        let abort = AbortHandle::new();
        abort.abort();
        let policy = RetryPolicy::backoff(5, Duration::from_secs(60));
        let result: Result<(), _> = retry_async(&policy, Some(&abort), |_| async {
            Err(StreamError::transport("down"))
        })
        .await;
        assert_eq!(result, Err(StreamError::Cancelled));
    }
}
