//! Retry logic with exponential backoff for transient backend errors.

use crate::config::RetryConfig;
use crate::context::CancelToken;
use crate::error::BackendError;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Backoff schedule for one action
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            backoff_factor: config.backoff_factor,
            max_delay: config.max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Something that can wait between attempts
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling thread
#[derive(Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// Returns immediately
#[derive(Debug, Default)]
pub struct NoSleep;

impl Sleeper for NoSleep {
    fn sleep(&self, _delay: Duration) {}
}

/// Records requested delays without waiting
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far
    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(delays) => delays.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        match self.delays.lock() {
            Ok(mut delays) => delays.push(delay),
            Err(poisoned) => poisoned.into_inner().push(delay),
        }
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: BackendError },
    /// A non-retryable error ended the loop
    Fatal { attempts: u32, error: BackendError },
    /// Cancellation was requested between attempts
    Cancelled { attempts: u32, last: BackendError },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Execute an operation with retry logic.
///
/// Retries the operation while it returns a retryable error, sleeping with
/// exponential backoff between attempts. `on_retry` is called before every
/// sleep with the failed attempt number (1-indexed), the error and the delay.
///
/// # Returns
/// The value and the number of attempts it took, or why the loop gave up.
pub fn with_retry<T, F, R>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut() -> Result<T, BackendError>,
    R: FnMut(u32, &BackendError, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match operation() {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(RetryError::Fatal {
                attempts: attempt,
                error,
            });
        }

        if attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        on_retry(attempt, &error, delay);
        sleeper.sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(240));
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(45),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(45));
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(
            &RetryPolicy::no_retry(),
            &NoSleep,
            &CancelToken::new(),
            |_, _, _| {},
            || Ok::<_, BackendError>(42),
        );
        assert_eq!(result.unwrap(), (42, 1));
    }

    #[test]
    fn test_non_retryable_error_stops() {
        let attempts = Cell::new(0);
        let result: Result<((), u32), _> = with_retry(
            &fast_policy(5),
            &NoSleep,
            &CancelToken::new(),
            |_, _, _| {},
            || {
                attempts.set(attempts.get() + 1);
                Err(BackendError::rejected("bad flavor"))
            },
        );
        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let attempts = Cell::new(0);
        let result = with_retry(
            &fast_policy(3),
            &NoSleep,
            &CancelToken::new(),
            |_, _, _| {},
            || {
                let current = attempts.get();
                attempts.set(current + 1);
                if current < 2 {
                    Err(BackendError::transient("timeout"))
                } else {
                    Ok(42)
                }
            },
        );
        assert_eq!(result.unwrap(), (42, 3));
    }

    #[test]
    fn test_exhausted_after_five_attempts_with_doubling_delays() {
        let sleeper = RecordingSleeper::new();
        let attempts = Cell::new(0);
        let retries = Cell::new(0);
        let result: Result<((), u32), _> = with_retry(
            &RetryPolicy::default(),
            &sleeper,
            &CancelToken::new(),
            |_, _, _| retries.set(retries.get() + 1),
            || {
                attempts.set(attempts.get() + 1);
                Err(BackendError::transient("timeout"))
            },
        );

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 5, .. })));
        assert_eq!(attempts.get(), 5);
        assert_eq!(retries.get(), 4);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(240),
            ]
        );
    }

    #[test]
    fn test_cancel_between_attempts() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result: Result<((), u32), _> = with_retry(
            &fast_policy(5),
            &NoSleep,
            &cancel,
            |_, _, _| {},
            || Err(BackendError::transient("timeout")),
        );
        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 1, .. })));
    }
}
