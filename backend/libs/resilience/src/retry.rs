/// Retry policy with exponential backoff and jitter
///
/// Only errors that report themselves as transient are retried. The
/// backoff sleep and the in-flight attempt both race the caller's
/// cancellation token.
use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Classification hook for retryable errors
pub trait Transient {
    /// `true` for timing/availability failures worth another attempt
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per call, including the first one
    pub max_attempts: u32,
    /// Backoff before the second attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in [0.8, 1.2]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether attempt number `attempt` (1-based) failing with `error` earns another try
    pub fn should_retry<E: Transient>(&self, attempt: u32, error: &E) -> bool {
        error.is_transient() && attempt < self.config.max_attempts
    }

    /// Sleep before the attempt following attempt number `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let base = self.config.initial_backoff.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);

        let factor = if self.config.jitter {
            rand::thread_rng().gen_range(0.8..=1.2)
        } else {
            1.0
        };

        let secs = (base * factor).min(self.config.max_backoff.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("Permanent failure after {attempts} attempt(s): {error}")]
    Permanent { attempts: u32, error: E },
    #[error("Retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },
    #[error("Cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Permanent { attempts, .. }
            | RetryError::Exhausted { attempts, .. }
            | RetryError::Cancelled { attempts } => *attempts,
        }
    }
}

/// Execute `f` under `policy`, passing the 1-based attempt number
pub async fn with_retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                RetryMetrics::record_attempts("cancelled", attempt);
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            outcome = f(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                RetryMetrics::record_attempts("success", attempt);
                return Ok(value);
            }
            Err(error) => error,
        };

        if !error.is_transient() {
            RetryMetrics::record_attempts("permanent", attempt);
            return Err(RetryError::Permanent {
                attempts: attempt,
                error,
            });
        }

        if !policy.should_retry(attempt, &error) {
            warn!(
                attempts = attempt,
                error = %error,
                "Max attempts ({}) reached",
                policy.config.max_attempts
            );
            RetryMetrics::record_attempts("exhausted", attempt);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.delay_for(attempt);
        debug!(
            error = %error,
            "Retry attempt {}/{}, waiting {:?}",
            attempt + 1,
            policy.config.max_attempts,
            delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                RetryMetrics::record_attempts("cancelled", attempt);
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Flaky,
        Broken,
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky)
        }
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn no_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            jitter: false,
            ..Default::default()
        })
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: false,
            ..Default::default()
        });

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(12), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_should_retry_only_transient_within_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, &TestError::Flaky));
        assert!(policy.should_retry(2, &TestError::Flaky));
        assert!(!policy.should_retry(3, &TestError::Flaky));
        assert!(!policy.should_retry(1, &TestError::Broken));
    }

    #[tokio::test]
    async fn test_retry_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&no_jitter(3), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_transient_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&no_jitter(3), &CancellationToken::new(), move |_| {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err(TestError::Flaky)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&no_jitter(3), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TestError::Flaky) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&no_jitter(3), &CancellationToken::new(), move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Err::<i32, _>(TestError::Broken) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Permanent { attempts: 1, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::new(RetryConfig {
            initial_backoff: Duration::from_secs(5),
            jitter: false,
            ..Default::default()
        });

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = with_retry(&policy, &cancel, |_| async { Err::<i32, _>(TestError::Flaky) }).await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1 })));
    }
}
