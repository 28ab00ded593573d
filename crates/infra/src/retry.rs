//! Retry policy with backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the attempt number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or the policy is exhausted.
    ///
    /// `label` only appears in log output. Returns the last error on
    /// exhaustion.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_while(label, op, |_| true).await
    }

    /// Like [`RetryPolicy::run`], but gives up at once on errors that
    /// `retryable` refuses.
    pub async fn run_while<T, E, F, Fut, R>(&self, label: &str, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        R: Fn(&E) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if retryable(&err) && self.should_retry(attempt) => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(1))
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_secs(1));
    }

    #[test]
    fn linear_backoff_grows_by_base() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
            ..RetryPolicy::fixed(3, Duration::from_millis(50))
        };
        // Capped by max_delay == base for `fixed`.
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(50));

        let uncapped = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..policy
        };
        assert_eq!(uncapped.delay_for_attempt(3), Duration::from_millis(150));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let policy = RetryPolicy::fixed(2, Duration::ZERO);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    #[tokio::test(start_paused = true)]
    async fn run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));

        let result: Result<u32, String> = policy
            .run("flaky", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));

        let result: Result<(), String> = policy
            .run("down", || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("attempt {n}"))
            })
            .await;

        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn run_while_stops_on_non_retryable_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));

        let result: Result<(), String> = policy
            .run_while(
                "ack",
                || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("lease expired".to_string())
                },
                |err: &String| err.contains("unavailable"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
