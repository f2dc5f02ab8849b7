//! # Retry Policy
//!
//! Exponential backoff with jitter for client-side command dispatch.
//! Only transient failures are retried: connection, timeout, and
//! transport-class errors. Validation, size, and type errors are terminal,
//! since resending the identical request can only fail the identical way.
//!
//! The delay for attempt `n` (zero-based) is
//! `min(max_delay, initial * backoff^n) * (1 + U(-jitter, +jitter))`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::CommandError;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 4,
        }
    }
}

impl RetryPolicy {
    /// Is this failure worth retrying at all?
    pub fn is_retriable(error: &CommandError) -> bool {
        matches!(
            error,
            CommandError::Timeout(_) | CommandError::Internal(_)
        )
    }

    /// Backoff delay before retry attempt `n` (zero-based), jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.backoff.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + factor)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out.
    /// The closure receives the zero-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, CommandError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CommandError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !Self::is_retriable(&error) || attempt + 1 >= self.max_attempts {
                        return Err(error);
                    }
                    tokio::time::sleep(self.delay_for(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(1),
            backoff: 2.0,
            max_delay: Duration::from_millis(8),
            jitter: 0.0,
            max_attempts: 4,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8));
        // Capped from here on.
        assert_eq!(policy.delay_for(10), Duration::from_millis(8));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = RetryPolicy {
            initial: Duration::from_secs(1),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_attempts: 4,
        };
        for attempt in 0..5 {
            let nominal = Duration::from_secs_f64(
                (policy.initial.as_secs_f64() * policy.backoff.powi(attempt as i32))
                    .min(policy.max_delay.as_secs_f64()),
            );
            for _ in 0..50 {
                let delay = policy.delay_for(attempt);
                assert!(delay.as_secs_f64() >= nominal.as_secs_f64() * 0.8 - 1e-9);
                assert!(delay.as_secs_f64() <= nominal.as_secs_f64() * 1.2 + 1e-9);
            }
        }
    }

    #[test]
    fn classification_of_retriable_errors() {
        assert!(RetryPolicy::is_retriable(&CommandError::Timeout(
            Duration::from_secs(1)
        )));
        assert!(RetryPolicy::is_retriable(&CommandError::internal("broker gone")));
        assert!(!RetryPolicy::is_retriable(&CommandError::invalid("bad")));
        assert!(!RetryPolicy::is_retriable(&CommandError::NotFound));
        assert!(!RetryPolicy::is_retriable(&CommandError::PayloadTooLarge {
            actual: 10,
            limit: 1
        }));
        assert!(!RetryPolicy::is_retriable(&CommandError::RangeOverflow));
        assert!(!RetryPolicy::is_retriable(&CommandError::InvalidType));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let policy = no_jitter();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result = policy
            .run(move |attempt| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err(CommandError::internal("flaky"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_fail_fast() {
        let policy = no_jitter();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), _> = policy
            .run(move |_| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(CommandError::NotFound)
                }
            })
            .await;
        assert!(matches!(result, Err(CommandError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_run_out() {
        let policy = no_jitter();
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<(), _> = policy
            .run(move |_| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(CommandError::internal("always down"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
