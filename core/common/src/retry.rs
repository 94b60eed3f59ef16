//! Exponential backoff with jitter for remote calls.
//!
//! Every call to the remote store goes through [`BackoffExecutor`]. The
//! executor only looks at the [`RemoteErrorKind`](crate::RemoteErrorKind) of a
//! failure: rate limits, server errors and network failures are retried, all
//! other failures propagate immediately.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::{Error, RemoteError, RemoteResult, Result};

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled on every further retry.
    pub base_delay: Duration,
    /// Cap on a single delay, jitter included.
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub jitter: Duration,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
}

impl BackoffConfig {
    /// Create a configuration with the given attempt budget.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            call_timeout: Duration::from_secs(60),
        }
    }

    /// Set base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set jitter bound. Zero disables jitter.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set per-attempt timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Calculate the delay after the given failed attempt (0-based).
    ///
    /// `min(base * 2^attempt, max_delay)` plus jitter drawn from
    /// `[0, min(jitter, base))`, clamped to `max_delay`. Keeping the jitter
    /// below the base delay makes successive delays non-decreasing.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(31)));
        let capped = exponential.min(self.max_delay);

        let jitter_bound = self.jitter.min(self.base_delay);
        let jitter = if jitter_bound.is_zero() {
            Duration::ZERO
        } else {
            jitter_bound.mul_f64(rand::random::<f64>())
        };

        (capped + jitter).min(self.max_delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Runs remote calls with retry logic.
///
/// Holds configuration only; each invocation owns its attempt counter, so one
/// executor can be shared freely between tasks.
#[derive(Debug, Clone, Default)]
pub struct BackoffExecutor {
    config: BackoffConfig,
}

impl BackoffExecutor {
    /// Create a new executor.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// Execute a remote call with retry logic.
    ///
    /// # Errors
    /// - `TransientNetwork` once `max_attempts` retryable failures happened
    /// - the permanent mapping of the first non-retryable failure
    pub async fn execute<F, Fut, T>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        self.execute_observed(operation, call, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), reporting each scheduled retry as
    /// `(failed_attempt, delay)` to `on_retry`.
    pub async fn execute_observed<F, Fut, T, O>(
        &self,
        operation: &str,
        mut call: F,
        mut on_retry: O,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
        O: FnMut(u32, Duration),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match timeout(self.config.call_timeout, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RemoteError::network(format!(
                    "timed out after {:?}",
                    self.config.call_timeout
                ))),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("{} failed permanently: {}", operation, err);
                return Err(err.into_permanent());
            }

            if attempt >= max_attempts {
                warn!("{} failed after {} attempts: {}", operation, attempt, err);
                return Err(Error::TransientNetwork(format!(
                    "{} failed after {} attempts: {}",
                    operation, attempt, err.message
                )));
            }

            let mut delay = self.config.delay_for_attempt(attempt - 1);
            if let Some(hint) = err.retry_after {
                delay = delay.max(hint.min(self.config.max_delay));
            }
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "{} failed: {}. Retrying",
                operation,
                err
            );
            on_retry(attempt, delay);
            sleep(delay).await;
        }
    }

    /// Get the backoff configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> BackoffConfig {
        BackoffConfig::new(max_attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(20))
            .with_jitter(Duration::from_millis(1))
    }

    /// Fails with `kind` for the first `failures` calls, then returns 42.
    async fn run_flaky(
        executor: &BackoffExecutor,
        failures: u32,
        error: RemoteError,
    ) -> (Result<i32>, u32, Vec<Duration>) {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let mut delays = Vec::new();

        let result = executor
            .execute_observed(
                "flaky",
                move || {
                    let counter = counter.clone();
                    let error = error.clone();
                    async move {
                        let current = counter.fetch_add(1, Ordering::SeqCst);
                        if current < failures {
                            Err(error)
                        } else {
                            Ok(42)
                        }
                    }
                },
                |_, delay| delays.push(delay),
            )
            .await;

        (result, attempts.load(Ordering::SeqCst), delays)
    }

    #[test]
    fn test_delay_calculation_without_jitter() {
        let config = BackoffConfig::new(5)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(Duration::ZERO);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::new(10)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(200), Duration::from_secs(10));
    }

    #[test]
    fn test_default_attempt_budget() {
        assert_eq!(BackoffConfig::default().max_attempts, 5);
    }

    #[tokio::test]
    async fn test_success_after_retryable_failures() {
        let executor = BackoffExecutor::new(fast_config(5));

        let (result, attempts, delays) =
            run_flaky(&executor, 3, RemoteError::server("503")).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 4);
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_exhaustion_is_transient_network_error() {
        let executor = BackoffExecutor::new(fast_config(5));

        let (result, attempts, delays) =
            run_flaky(&executor, 5, RemoteError::rate_limited("429")).await;

        assert!(matches!(result, Err(Error::TransientNetwork(_))));
        assert_eq!(attempts, 5);
        assert_eq!(delays.len(), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_not_retried() {
        let executor = BackoffExecutor::new(fast_config(5));

        let (result, attempts, _) =
            run_flaky(&executor, 1, RemoteError::rejected("400 bad request")).await;

        assert!(matches!(result, Err(Error::PermanentRemote(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_auth_error() {
        let executor = BackoffExecutor::new(fast_config(5));

        let (result, attempts, _) =
            run_flaky(&executor, 1, RemoteError::unauthorized("401")).await;

        assert!(matches!(result, Err(Error::Auth(_))));
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_after_hint_raises_delay() {
        let executor = BackoffExecutor::new(fast_config(3));
        let hinted = RemoteError::rate_limited("429").with_retry_after(Duration::from_millis(15));

        let (result, _, delays) = run_flaky(&executor, 1, hinted).await;

        assert!(result.is_ok());
        assert_eq!(delays, vec![Duration::from_millis(15)]);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        let executor = BackoffExecutor::new(
            fast_config(2).with_call_timeout(Duration::from_millis(5)),
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = executor
            .execute("slow", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::TransientNetwork(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_delays_never_decrease(
            base_ms in 1u64..2_000,
            max_ms in 1u64..120_000,
            jitter_ms in 0u64..5_000,
        ) {
            let config = BackoffConfig::new(10)
                .with_base_delay(Duration::from_millis(base_ms))
                .with_max_delay(Duration::from_millis(max_ms))
                .with_jitter(Duration::from_millis(jitter_ms));

            let delays: Vec<Duration> = (0..10).map(|a| config.delay_for_attempt(a)).collect();
            for pair in delays.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
            prop_assert!(delays.iter().all(|d| *d <= config.max_delay));
        }
    }
}
