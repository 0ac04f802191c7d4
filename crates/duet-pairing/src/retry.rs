//! Retry and backoff wrappers for fallible asynchronous operations.
//!
//! Two policies are provided. [`retry_with_backoff`] is the general wrapper
//! used for pairing transitions: exponential delays, a per-attempt deadline,
//! and an immediate bail-out on `PermissionDenied`. [`retry_transient`] is
//! the fixed-delay variant used by the presence subsystem's setup path,
//! which only retries transient infrastructure failures.
//!
//! Neither variant applies jitter.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{PairingError, Result};
use crate::types::PairingConfig;

/// Retry parameters for a wrapped operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay between attempts. Doubled per attempt under
    /// [`retry_with_backoff`], applied as-is under [`retry_transient`].
    pub initial_delay: Duration,
    /// Absolute deadline for each individual attempt.
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Build the exponential-backoff policy from engine configuration.
    #[must_use]
    pub fn backoff(config: &PairingConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }

    /// Build the fixed-delay presence policy from engine configuration.
    #[must_use]
    pub fn presence(config: &PairingConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay: Duration::from_millis(config.presence_retry_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

/// Run one attempt under the policy's deadline.
async fn attempt<T, Fut>(policy: &RetryPolicy, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(policy.attempt_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(PairingError::OperationTimedOut),
    }
}

/// Re-execute a fallible operation under exponential backoff.
///
/// `PermissionDenied` fails immediately and is never retried. Validation
/// errors are not retryable and surface on the first attempt. Retryable
/// failures wait `initial_delay * 2^n` before attempt `n + 1`; once the
/// attempt cap is reached the last error surfaces.
///
/// # Errors
///
/// Returns the operation's first non-retryable error, or its last error
/// once attempts are exhausted.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        match attempt(policy, op()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_permission_denied() => return Err(err),
            Err(err) => {
                attempts += 1;
                if attempts >= policy.max_attempts || !err.is_retriable() {
                    return Err(err);
                }
                let delay = policy.initial_delay * 2u32.saturating_pow(attempts - 1);
                debug!(attempts, ?delay, error = %err, "Retrying after backoff");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Re-execute a fallible operation with a fixed delay, retrying only
/// transient classifications.
///
/// Used by the presence subsystem, where the store being briefly
/// unreachable is expected and anything else should surface at once.
///
/// # Errors
///
/// Returns the operation's first non-transient error, or its last error
/// once attempts are exhausted.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0u32;
    loop {
        match attempt(policy, op()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts += 1;
                if attempts >= policy.max_attempts || !err.is_transient() {
                    return Err(err);
                }
                debug!(attempts, error = %err, "Retrying transient failure");
                tokio::time::sleep(policy.initial_delay).await;
            }
        }
    }
}
