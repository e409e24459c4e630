//! Bounded exponential backoff for remote calls that may fail transiently.
//!
//! Only [`RemoteError::is_retryable`] failures are retried. Everything else is
//! handed back to the caller on the first occurrence. The loop stops when the
//! attempt cap or the total wait budget is reached, or when the caller's
//! cancellation token fires, whichever comes first.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Error, RemoteError};

/// Backoff configuration for calls against an eventually-consistent remote.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = bounded by `max_elapsed` only)
    pub max_attempts: u32,
    /// Initial delay between attempts, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts, in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Total time budget across all attempts and sleeps, in seconds
    pub max_elapsed_secs: u64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_elapsed_secs: 600,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }

    /// Reject settings that would make the backoff shrink or spin.
    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::validation(format!(
                "retry backoff_multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay_ms == 0 {
            return Err(Error::validation("retry initial_delay_ms must be greater than 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::validation(format!(
                "retry max_delay_ms ({}) must not be below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        Ok(())
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        // Unvalidated configs still never shrink the delay.
        let multiplier = if self.backoff_multiplier.is_finite() {
            self.backoff_multiplier.max(1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(
            (delay.as_secs_f64() * multiplier).min(self.max_delay().as_secs_f64()),
        )
    }
}

/// Why a retried call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// The call failed with a non-retryable error.
    Rejected { attempts: u32, error: RemoteError },
    /// Retryable failures consumed the whole budget.
    Exhausted { attempts: u32, last: RemoteError },
    /// The cancellation token fired.
    Canceled { attempts: u32 },
}

/// Execute a remote call with exponential backoff and jitter.
///
/// `operation` is invoked once per attempt. Cancellation is observed both
/// while the call is outstanding and while sleeping between attempts.
pub async fn retry_remote<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let started = Instant::now();
    let budget = config.max_elapsed();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay();

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Canceled { attempts: attempt });
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Canceled { attempts: attempt }),
            r = operation() => r,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                return Err(RetryError::Rejected {
                    attempts: attempt,
                    error: e,
                });
            }
            Err(e) => e,
        };

        let sleep_for = if config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * factor)
        } else {
            delay
        };

        let attempts_spent = config.max_attempts > 0 && attempt >= config.max_attempts;
        let budget_spent = started.elapsed() + sleep_for > budget;
        if attempts_spent || budget_spent {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Retry budget exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: err,
            });
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = sleep_for.as_millis() as u64,
            "Remote call failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Canceled { attempts: attempt }),
            _ = tokio::time::sleep(sleep_for) => {}
        }

        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_immediately() {
        let cancel = CancellationToken::new();
        let result = retry_remote(&fast(3), "op", &cancel, || async { Ok::<_, RemoteError>(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_retryable_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = retry_remote(&fast(5), "op", &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RemoteError::NotReady("cluster modifying".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_remote(&fast(5), "op", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Fatal("access denied".into()))
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Rejected {
                attempts: 1,
                error: RemoteError::Fatal("access denied".into())
            })
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempt_cap() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry_remote(&fast(3), "op", &cancel, || async {
            Err(RemoteError::Throttled("rate exceeded".into()))
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: RemoteError::Throttled("rate exceeded".into())
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_time_budget() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            max_elapsed_secs: 5,
            jitter: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let result: Result<(), _> = retry_remote(&config, "op", &cancel, || async {
            Err(RemoteError::Unavailable("connection reset".into()))
        })
        .await;

        // Sleeps of 1s each; the sixth would cross the 5s budget.
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 6, .. })));
        assert!(started.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay_ms: 1_000,
            max_delay_ms: 1_000,
            max_elapsed_secs: 3_600,
            jitter: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = retry_remote(&config, "op", &cancel, || async {
            Err(RemoteError::NotReady("cluster creating".into()))
        })
        .await;

        assert_eq!(result, Err(RetryError::Canceled { attempts: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn already_canceled_makes_no_call() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retry_remote(&fast(3), "op", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RemoteError>(())
            }
        })
        .await;

        assert_eq!(result, Err(RetryError::Canceled { attempts: 0 }));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn backoff_is_capped() {
        let config = fast(0);
        let mut delay = config.initial_delay();
        for _ in 0..10 {
            delay = config.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_millis(100));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(fast(3).validate().is_ok());
    }

    #[test]
    fn shrinking_or_spinning_backoff_is_rejected() {
        for multiplier in [-1.0, 0.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = RetryConfig {
                backoff_multiplier: multiplier,
                ..fast(3)
            };
            assert!(
                matches!(config.validate(), Err(Error::Validation(_))),
                "multiplier {} accepted",
                multiplier
            );
        }

        let zero_delay = RetryConfig {
            initial_delay_ms: 0,
            ..fast(3)
        };
        assert!(zero_delay.validate().is_err());

        let inverted = RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..fast(3)
        };
        assert!(inverted.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn negative_multiplier_does_not_panic() {
        let config = RetryConfig {
            backoff_multiplier: -1.0,
            ..fast(3)
        };
        let cancel = CancellationToken::new();

        let result: Result<(), _> = retry_remote(&config, "op", &cancel, || async {
            Err(RemoteError::NotReady("cluster creating".into()))
        })
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
        assert_eq!(config.next_delay(Duration::from_millis(10)), Duration::from_millis(10));
    }
}
