//! Retry logic.
//!
//! # Responsibilities
//! - Decide, per failure, whether a store call may be retried
//! - Execute retries with exponential backoff + jitter
//! - Honour server pacing (`Retry-After`) when the failure carries it
//!
//! # Design Decisions
//! - Classification lives on the error type (`Retryable`), not in the loop
//! - Authentication failures are never retried
//! - The caller sees either the fatal error or the last error plus the attempt count

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::observability::metrics;
use crate::resilience::backoff::delay_for;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Do not retry; surface immediately.
    Fatal,
    /// Retry after the policy's backoff.
    Retry,
    /// Retry after the given server-provided delay.
    RetryAfter(Duration),
}

/// Implemented by error types that know whether they are transient.
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

/// Retry parameters for one class of calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Why a retried operation finally gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was classified as non-retryable.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Run `operation` until it succeeds, fails fatally, or runs out of attempts.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
    mut operation: F,
) -> Result<T, RetryFailure<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let hint = err.retry_hint();
        if hint == RetryHint::Fatal {
            return Err(RetryFailure::Fatal(err));
        }
        if attempt >= policy.max_attempts {
            tracing::warn!(op = op_name, attempts = attempt, error = %err, "Store call failed, retries exhausted");
            return Err(RetryFailure::Exhausted { attempts: attempt, last: err });
        }

        let retry_after = match hint {
            RetryHint::RetryAfter(delay) => Some(delay),
            _ => None,
        };
        let delay = delay_for(attempt, policy.base_delay_ms, policy.max_delay_ms, retry_after);
        tracing::debug!(
            op = op_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying store call"
        );
        metrics::record_store_retry(op_name);
        tokio::time::sleep(delay).await;
    }
}
