//! Retry policy and retry loop
//!
//! A failed attempt is first offered to a recovery hook (the error
//! middleware). Only when nothing recovers it is retry eligibility checked:
//! `enabled && attempt < retries && predicate(error, attempt)`.

use crate::config::{Backoff, RetryConfig};
use crate::error::{CallError, Result};
use rand::Rng;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Largest exponent applied to the base delay
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Decides whether `(error, attempt)` deserves another attempt
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&CallError, u32) -> bool + Send + Sync>);

impl RetryPredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CallError, u32) -> bool + Send + Sync + 'static,
    {
        RetryPredicate(Arc::new(f))
    }

    pub fn test(&self, error: &CallError, attempt: u32) -> bool {
        (self.0)(error, attempt)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

impl PartialEq for RetryPredicate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Successful result of a retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome {
    pub value: Value,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Whether the value came from the recovery hook
    pub recovered: bool,
}

/// Retry policy resolved for one call
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        RetryPolicy { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Check if we should retry based on the attempt number and error
    ///
    /// `attempt` is zero-based: the first attempt is attempt 0.
    pub fn should_retry(&self, attempt: u32, error: &CallError) -> bool {
        if !self.config.enabled || attempt >= self.config.retries || error.is_terminal() {
            return false;
        }

        match &self.config.retry_on {
            Some(predicate) => predicate.test(error, attempt),
            None => error.should_retry(),
        }
    }

    /// Backoff before jitter for a given attempt
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.config.delay_ms;
        let ms = match self.config.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                base.saturating_mul(1u64 << attempt.min(MAX_BACKOFF_EXPONENT))
            }
        };

        let ms = match self.config.max_delay_ms {
            Some(max) => ms.min(max),
            None => ms,
        };

        Duration::from_millis(ms)
    }

    /// Backoff with jitter applied
    ///
    /// The delay is drawn uniformly from `[d - jitter*d, d + jitter*d]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_duration(attempt);
        let jitter = self.config.jitter;
        if jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let ms = delay.as_millis() as f64;
        let spread = ms * jitter.min(1.0);
        let sampled = rand::thread_rng().gen_range((ms - spread)..=(ms + spread));
        Duration::from_millis(sampled.max(0.0).round() as u64)
    }

    /// Run `operation` until it succeeds, is recovered, or retries run out
    ///
    /// # Arguments
    /// * `operation` - Called with the zero-based attempt number
    /// * `recover` - Offered every failure; `Some` ends the loop as a success
    pub async fn execute<F, Fut, R>(&self, mut operation: F, mut recover: R) -> Result<RetryOutcome>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value>>,
        R: FnMut(&CallError, u32) -> Option<Value>,
    {
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return Ok(RetryOutcome {
                        value,
                        attempts: attempt + 1,
                        recovered: false,
                    })
                }
                Err(error) => {
                    if let Some(value) = recover(&error, attempt) {
                        debug!(
                            "Failure recovered by error middleware (attempt {}): {}",
                            attempt + 1,
                            error
                        );
                        return Ok(RetryOutcome {
                            value,
                            attempts: attempt + 1,
                            recovered: true,
                        });
                    }

                    if !self.should_retry(attempt, &error) {
                        return Err(error);
                    }

                    let backoff = self.delay_for(attempt);
                    warn!(
                        "Attempt {} failed, retrying after {:?}: {}",
                        attempt + 1,
                        backoff,
                        error
                    );
                    sleep(backoff).await;

                    attempt += 1;
                }
            }
        }
    }
}
