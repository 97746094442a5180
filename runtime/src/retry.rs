//! Retry orchestration with jittered exponential backoff.
//!
//! Conflicts and deadlocks are transient: another writer got there first, or
//! the storage engine broke a lock cycle. Re-running the whole
//! read-compute-write sequence against fresh state usually succeeds. This
//! module owns that loop.
//!
//! # Policy
//!
//! - Retryable: [`RegistrationError::Conflict`] and [`RegistrationError::Deadlock`]
//! - Before retry `n` (1-based) wait `base_delay * random(1..=2^n)`, capped
//!   at `max_delay`
//! - After `max_attempts` retryable failures, return
//!   [`RegistrationError::RetriesExhausted`] wrapping the last one
//! - Every other error is final and returned immediately
//!
//! # Example
//!
//! ```rust
//! use turnstile_runtime::retry::{RetryPolicy, with_retry};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), turnstile_core::RegistrationError> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(10))
//!     .max_delay(Duration::from_secs(1))
//!     .build();
//!
//! let value = with_retry(&policy, "example", || async {
//!     // Your read-compute-write attempt here
//!     Ok(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use turnstile_core::RegistrationError;

/// Exponent cap so `2^attempt` never overflows.
const MAX_EXPONENT: u32 = 16;

/// Retry policy configuration for jittered exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 5
/// - `base_delay`: 10ms
/// - `max_delay`: 1 second
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Unit of backoff
    pub base_delay: Duration,
    /// Upper bound for a single wait
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Largest wait before retry `attempt`: `base_delay * 2^attempt`, capped.
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        self.scaled(1_u32 << attempt.min(MAX_EXPONENT))
    }

    /// Random wait before retry `attempt` (1-based).
    ///
    /// Uniform in `base_delay * [1, 2^attempt]`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let upper = 1_u32 << attempt.min(MAX_EXPONENT);
        let factor = rand::thread_rng().gen_range(1..=upper);
        self.scaled(factor)
    }

    fn scaled(&self, factor: u32) -> Duration {
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set total attempts (values below 1 are treated as 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the backoff unit.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(5).max(1),
            base_delay: self.base_delay.unwrap_or(Duration::from_millis(10)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(1)),
        }
    }
}

/// Run `attempt` until it succeeds, fails finally, or the budget runs out.
///
/// `attempt` must perform the *entire* read-compute-write sequence on every
/// call; a retry never replays a stale write.
///
/// # Errors
///
/// - The first final (non-retryable) error, unchanged
/// - [`RegistrationError::RetriesExhausted`] after `policy.max_attempts`
///   retryable failures
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, RegistrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RegistrationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0_u32;

    loop {
        attempts += 1;
        match attempt().await {
            Ok(result) => {
                if attempts > 1 {
                    tracing::info!(operation, attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) if err.is_retryable() => {
                RetryMetrics::record_conflict(operation, err.kind());

                if attempts >= max_attempts {
                    tracing::error!(
                        operation,
                        attempts,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    RetryMetrics::record_exhausted(operation);
                    return Err(RegistrationError::RetriesExhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }

                let delay = policy.delay_for_attempt(attempts);
                tracing::warn!(
                    operation,
                    attempt = attempts,
                    kind = err.kind(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Retryable failure, retrying..."
                );
                RetryMetrics::record_retry(operation, err.kind());
                sleep(delay).await;
            }
            Err(err) => {
                tracing::debug!(
                    operation,
                    attempts,
                    kind = err.kind(),
                    "Error is not retryable, failing immediately"
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap/panic
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use turnstile_core::{EventId, RegistrationError};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
            .build()
    }

    fn conflict() -> RegistrationError {
        RegistrationError::Conflict {
            entity: None,
            expected: None,
            actual: None,
            detail: "test".to_string(),
        }
    }

    #[test]
    fn test_backoff_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .build();

        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(800));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_secs(1));
        assert_eq!(policy.backoff_ceiling(200), Duration::from_secs(1));
    }

    #[test]
    fn test_builder_defaults_and_floor() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(10));
        assert_eq!(RetryPolicy::builder().max_attempts(0).build().max_attempts, 1);
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_window(
            attempt in 1_u32..40,
            base_ms in 0_u64..200,
            max_ms in 0_u64..5_000,
        ) {
            let policy = RetryPolicy::builder()
                .base_delay(Duration::from_millis(base_ms))
                .max_delay(Duration::from_millis(max_ms))
                .build();
            let delay = policy.delay_for_attempt(attempt);
            let floor = Duration::from_millis(base_ms.min(max_ms));
            prop_assert!(delay >= floor);
            prop_assert!(delay <= policy.backoff_ceiling(attempt));
            prop_assert!(delay <= Duration::from_millis(max_ms));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);

        let result = with_retry(&fast_policy(3), "test", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, RegistrationError>(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_absorbs_conflicts_and_deadlocks() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);

        let result = with_retry(&fast_policy(5), "test", || {
            let c = Arc::clone(&c);
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(conflict()),
                    1 => Err(RegistrationError::Deadlock("cycle".to_string())),
                    _ => Ok(7),
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);

        let result: Result<(), _> = with_retry(&fast_policy(3), "test", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(conflict())
            }
        })
        .await;

        match result {
            Err(RegistrationError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_retryable());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_final_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let event_id = EventId::new();

        let result: Result<(), _> = with_retry(&fast_policy(5), "test", || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(RegistrationError::CapacityExceeded {
                    event_id,
                    requested: 1,
                    available: 0,
                })
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RegistrationError::CapacityExceeded { .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_exhausts_immediately() {
        let result: Result<(), _> =
            with_retry(&RetryPolicy::no_retry(), "test", || async { Err(conflict()) }).await;
        assert!(matches!(
            result,
            Err(RegistrationError::RetriesExhausted { attempts: 1, .. })
        ));
    }
}
