//! Retry handler for RETRYABLE step failures.
//!
//! Stateless: all logic is in associated functions that take the step's
//! resolved `RetryPolicy` as a parameter.

use std::time::Duration;

use loomflow_types::pipeline::RetryPolicy;
use loomflow_types::run::ErrorCode;

/// Stateless retry handler for transient failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether another invocation should be attempted.
    ///
    /// Only `RETRYABLE` failures are retried. `invocations` is the number of
    /// invocations made so far (the first execution counts as 1).
    pub fn should_retry(policy: &RetryPolicy, code: ErrorCode, invocations: u32) -> bool {
        code == ErrorCode::Retryable && invocations < policy.max_attempts
    }

    /// Delay before the next invocation after `failures` consecutive failures.
    ///
    /// `min(max_backoff_ms, initial_backoff_ms * multiplier^(failures - 1))`.
    pub fn backoff_delay(policy: &RetryPolicy, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.initial_backoff_ms as f64 * policy.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(policy.max_backoff_ms as f64)
        } else {
            policy.max_backoff_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry_within_limit() {
        let policy = RetryPolicy::default();
        assert!(RetryHandler::should_retry(&policy, ErrorCode::Retryable, 1));
        assert!(RetryHandler::should_retry(&policy, ErrorCode::Retryable, 2));
        assert!(!RetryHandler::should_retry(&policy, ErrorCode::Retryable, 3));
    }

    #[test]
    fn test_terminal_codes_never_retry() {
        let policy = RetryPolicy::default();
        assert!(!RetryHandler::should_retry(&policy, ErrorCode::NonRetryable, 1));
        assert!(!RetryHandler::should_retry(&policy, ErrorCode::ValidationFail, 1));
        assert!(!RetryHandler::should_retry(
            &policy,
            ErrorCode::QualityBelowThreshold,
            1
        ));
    }

    #[test]
    fn test_single_attempt_policy_never_retries() {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        };
        assert!(!RetryHandler::should_retry(&policy, ErrorCode::Retryable, 1));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(RetryHandler::backoff_delay(&policy, 1), Duration::from_millis(500));
        assert_eq!(RetryHandler::backoff_delay(&policy, 2), Duration::from_millis(1000));
        assert_eq!(RetryHandler::backoff_delay(&policy, 3), Duration::from_millis(2000));
        assert_eq!(RetryHandler::backoff_delay(&policy, 10), Duration::from_millis(30_000));
        assert_eq!(RetryHandler::backoff_delay(&policy, 5000), Duration::from_millis(30_000));
    }
}
