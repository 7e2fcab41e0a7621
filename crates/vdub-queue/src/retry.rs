//! Retry policy with exponential backoff.
//!
//! Delay for failed attempt `n` is `min(base * 3^(n-1), max)`. With the
//! defaults three attempts wait 5s, 15s and 45s.

use std::time::Duration;

use crate::classifier::Classification;

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub factor: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(300_000),
            factor: 3,
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts: u32 = std::env::var("RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_attempts);

        let base_delay_ms: u64 = std::env::var("RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5_000);

        let max_delay_ms: u64 = std::env::var("RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(300_000);

        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
            ..defaults
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Backoff before retrying after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Decide what happens after attempt `attempt` failed.
    pub fn decide(&self, classification: Classification, attempt: u32) -> RetryDecision {
        if !classification.retryable {
            RetryDecision::Fail
        } else if attempt >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry {
                delay: self.delay_for_attempt(attempt),
                next_attempt: attempt + 1,
            }
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Redeliver after `delay`.
    Retry { delay: Duration, next_attempt: u32 },
    /// Retries exhausted.
    DeadLetter,
    /// Not retryable; fail immediately.
    Fail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdub_models::ErrorKind;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let ms = |n| policy.delay_for_attempt(n).as_millis();

        assert_eq!(ms(1), 5_000);
        assert_eq!(ms(2), 15_000);
        assert_eq!(ms(3), 45_000);
        assert_eq!(ms(4), 135_000);
        assert_eq!(ms(5), 300_000);
        assert_eq!(ms(7), 300_000);
        assert_eq!(ms(u32::MAX), 300_000);
    }

    #[test]
    fn test_decide() {
        let policy = RetryPolicy::default();
        let transient = Classification::of(ErrorKind::Transient);

        assert_eq!(
            policy.decide(transient, 1),
            RetryDecision::Retry {
                delay: Duration::from_secs(5),
                next_attempt: 2
            }
        );
        assert_eq!(policy.decide(transient, 3), RetryDecision::DeadLetter);
        assert_eq!(
            policy.decide(Classification::of(ErrorKind::Validation), 1),
            RetryDecision::Fail
        );
        assert_eq!(
            policy.decide(Classification::of(ErrorKind::Permanent), 3),
            RetryDecision::Fail
        );
    }

    #[test]
    fn test_single_attempt_policy_dead_letters_immediately() {
        let policy = RetryPolicy::default().with_max_attempts(1);
        assert_eq!(
            policy.decide(Classification::of(ErrorKind::Timeout), 1),
            RetryDecision::DeadLetter
        );
    }
}
