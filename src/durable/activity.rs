//! Activity execution with timeout, bounded retry, and exponential backoff.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::durable::failure::ActivityFailure;
use crate::error::Error;
use crate::normalize::panic_message;

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

/// Per-activity execution options.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Timeout applied to each attempt.
    pub start_to_close_timeout: Duration,
    pub retry: RetryPolicy,
    /// Error codes that end the activity on first occurrence, on top of
    /// whatever [`Error::is_retryable`] already refuses.
    pub non_retryable_codes: Vec<&'static str>,
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            start_to_close_timeout,
            retry,
            non_retryable_codes: Vec::new(),
        }
    }

    pub fn with_non_retryable(mut self, codes: &[&'static str]) -> Self {
        self.non_retryable_codes.extend_from_slice(codes);
        self
    }

    fn should_retry(&self, err: &Error) -> bool {
        err.is_retryable() && !self.non_retryable_codes.contains(&err.code())
    }

    /// Longest time the activity can take before giving up: every attempt
    /// running to its timeout, plus the backoff between attempts.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.retry.max_attempts.max(1);
        let backoff: Duration = (1..attempts).map(|a| self.retry.delay_after(a)).sum();
        self.start_to_close_timeout * attempts + backoff
    }
}

/// Run a named activity under `options`.
///
/// `attempt_fn` receives the 1-based attempt number and is invoked once per
/// attempt, so the activity body must be safe to execute more than once.
/// Panics inside an attempt are caught and treated as non-retryable failures.
pub async fn run_activity<T, F, Fut>(
    name: &str,
    options: &ActivityOptions,
    mut attempt_fn: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let max_attempts = options.retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(activity = name, attempt, "Activity attempt started");

        let guarded = AssertUnwindSafe(attempt_fn(attempt)).catch_unwind();
        let result = match tokio::time::timeout(options.start_to_close_timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(Error::Panicked {
                context: format!("activity {name}"),
                message: panic_message(payload.as_ref()),
            }),
            Err(_) => Err(Error::TimedOut {
                context: format!("activity {name}"),
                timeout: options.start_to_close_timeout,
            }),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(activity = name, attempt, "Activity succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !options.should_retry(&err) {
            warn!(activity = name, attempt, error = %err, "Activity failed with non-retryable error");
            return Err(ActivityFailure::new(name, attempt, err).into());
        }

        if attempt >= max_attempts {
            warn!(activity = name, attempt, error = %err, "Activity retries exhausted");
            return Err(ActivityFailure::new(name, attempt, err).into());
        }

        let delay = options.retry.delay_after(attempt);
        warn!(
            activity = name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Activity attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
