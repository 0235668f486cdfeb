//! Retry logic with exponential backoff for transient action failures.

use crate::context::{ActionContext, CancelToken};
use crate::error::ActionError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Configuration for retrying transient failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called before sleeping ahead of another attempt.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ActionError, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &ActionError, _delay: Duration) {}
}

/// Callback that logs retries for a named node.
pub struct LogCallback<'a>(pub &'a str);

impl RetryCallback for LogCallback<'_> {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ActionError, delay: Duration) {
        log::warn!(
            "{}: attempt {}/{} failed: {}. Retrying in {}s",
            self.0,
            attempt,
            max_attempts,
            error,
            delay.as_secs()
        );
    }
}

/// Execute an operation with retry logic.
///
/// Only [`ActionError::Transient`] failures are retried. Back-off sleeps are
/// cut short by cancellation, in which case [`ActionError::Cancelled`] is
/// returned. The operation receives the 0-indexed attempt number.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    callback: Option<&dyn RetryCallback>,
    operation: F,
) -> Result<T, ActionError>
where
    F: FnMut(u32) -> Result<T, ActionError>,
{
    retry_until(config, cancel, None, callback, operation)
}

/// Execute an operation with the retry policy, cancellation and deadline of
/// an action context.
///
/// A retry whose back-off would overrun the deadline is not attempted; the
/// call fails with [`ActionError::TimedOut`] instead.
pub fn with_retry_in<T, F>(ctx: &ActionContext, operation: F) -> Result<T, ActionError>
where
    F: FnMut(u32) -> Result<T, ActionError>,
{
    retry_until(
        &ctx.retry,
        &ctx.cancel,
        ctx.deadline,
        Some(&LogCallback(&ctx.node)),
        operation,
    )
}

fn retry_until<T, F>(
    config: &RetryConfig,
    cancel: &CancelToken,
    deadline: Option<Instant>,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> Result<T, ActionError>
where
    F: FnMut(u32) -> Result<T, ActionError>,
{
    let started = Instant::now();
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ActionError::Cancelled);
        }

        let error = match operation(attempt) {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !error.is_retryable() || attempt + 1 >= max_attempts {
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        if let Some(deadline) = deadline
            && Instant::now() + delay >= deadline
        {
            return Err(ActionError::TimedOut {
                after: deadline.saturating_duration_since(started),
            });
        }

        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &error, delay);
        }

        if !cancel.sleep(delay) {
            return Err(ActionError::Cancelled);
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_delay_schedule() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(20));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(300));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn test_success_first_try() {
        let result = with_retry(&RetryConfig::no_retry(), &CancelToken::new(), None, |_| {
            Ok::<_, ActionError>(42)
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_permanent_error_not_retried() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancelToken::new(), None, |_| {
            attempts.set(attempts.get() + 1);
            Err(ActionError::permanent("invalid credentials"))
        });

        assert!(matches!(result, Err(ActionError::Permanent { .. })));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let result = with_retry(&fast(), &CancelToken::new(), None, |attempt| {
            if attempt < 2 {
                Err(ActionError::transient("connection reset"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_all_attempts_fail() {
        let attempts = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(), &CancelToken::new(), None, |_| {
            attempts.set(attempts.get() + 1);
            Err(ActionError::transient("timeout"))
        });

        assert!(matches!(result, Err(ActionError::Transient { .. })));
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_callback_invoked_between_attempts() {
        struct CountingCallback(Arc<AtomicU32>);
        impl RetryCallback for CountingCallback {
            fn on_retry(&self, _: u32, _: u32, _: &ActionError, _: Duration) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicU32::new(0));
        let callback = CountingCallback(count.clone());
        let _: Result<(), _> = with_retry(&fast(), &CancelToken::new(), Some(&callback), |_| {
            Err(ActionError::transient("timeout"))
        });

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cancel_stops_backoff() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(60),
            ..fast()
        };
        let cancel = CancelToken::new();
        let attempts = Cell::new(0);

        let started = Instant::now();
        let result: Result<(), _> = with_retry(&config, &cancel, None, |_| {
            attempts.set(attempts.get() + 1);
            cancel.cancel();
            Err(ActionError::transient("rate limited"))
        });

        assert!(matches!(result, Err(ActionError::Cancelled)));
        assert_eq!(attempts.get(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_deadline_prevents_long_backoff() {
        let mut ctx = ActionContext::new("database");
        ctx.retry = RetryConfig {
            base_delay: Duration::from_secs(60),
            ..fast()
        };
        ctx.deadline = Some(Instant::now() + Duration::from_secs(1));

        let result: Result<(), _> =
            with_retry_in(&ctx, |_| Err(ActionError::transient("throttled")));
        assert!(matches!(result, Err(ActionError::TimedOut { .. })));
    }
}
