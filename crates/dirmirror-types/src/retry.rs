//! Retry policy for failed remote operations
//!
//! The policy is pure: it maps `(attempts, failure class)` to a decision and
//! performs no I/O. Only [`RetryPolicy::decide`] touches a random number
//! generator, and it delegates to [`RetryPolicy::decide_with_jitter`] so the
//! arithmetic can be exercised deterministically.

use crate::config::RetryConfig;
use crate::error::FailureClass;
use rand::Rng;
use std::time::Duration;

/// Smallest delay the policy will ever hand out
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// What to do with an operation that just failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the delay has elapsed
    Retry(Duration),
    /// Give up and move the operation to the dead-letter list
    DeadLetter,
}

impl RetryDecision {
    /// Whether the decision schedules another attempt
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// Exponential backoff with symmetric jitter and a bounded attempt budget
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Create a policy from a validated retry configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Maximum attempts before an operation is dead-lettered
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// The underlying configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what happens after the `attempts`-th attempt failed
    pub fn decide(&self, attempts: u32, class: FailureClass) -> RetryDecision {
        let unit = rand::thread_rng().gen::<f64>();
        self.decide_with_jitter(attempts, class, unit)
    }

    /// Same as [`decide`](Self::decide) with the jitter sample supplied.
    ///
    /// `unit` is clamped into `[0, 1]`; `0.5` means no jitter, `0.0` and `1.0`
    /// shift the delay by the full negative and positive jitter fraction.
    pub fn decide_with_jitter(&self, attempts: u32, class: FailureClass, unit: f64) -> RetryDecision {
        if class == FailureClass::Permanent || attempts >= self.config.max_attempts {
            return RetryDecision::DeadLetter;
        }

        let base = self.backoff(attempts);
        let unit = if unit.is_finite() { unit.clamp(0.0, 1.0) } else { 0.5 };
        let factor = 1.0 + self.config.jitter * (2.0 * unit - 1.0);
        let delay = base.mul_f64(factor.max(0.0));

        RetryDecision::Retry(delay.max(MIN_RETRY_DELAY))
    }

    /// Backoff before jitter: `base * 2^(attempts - 1)`, capped
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.config
            .base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.config.max_delay, |delay| delay.min(self.config.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn policy(max_attempts: u32, jitter: f64) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::new(
                max_attempts,
                Duration::from_millis(100),
                Duration::from_secs(2),
                jitter,
            )
            .unwrap(),
        )
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 400)]
    #[case(5, 1600)]
    #[case(6, 2000)]
    #[case(40, 2000)]
    fn test_backoff_doubles_until_cap(#[case] attempts: u32, #[case] expected_ms: u64) {
        assert_eq!(
            policy(100, 0.0).backoff(attempts),
            Duration::from_millis(expected_ms)
        );
    }

    #[test]
    fn test_permanent_failure_is_dead_lettered_immediately() {
        let policy = policy(5, 0.2);
        assert_eq!(
            policy.decide(1, FailureClass::Permanent),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = policy(3, 0.0);
        assert!(policy.decide(1, FailureClass::Transient).is_retry());
        assert!(policy.decide(2, FailureClass::Transient).is_retry());
        assert_eq!(
            policy.decide(3, FailureClass::Transient),
            RetryDecision::DeadLetter
        );
        assert_eq!(
            policy.decide(4, FailureClass::Transient),
            RetryDecision::DeadLetter
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = policy(10, 0.25);
        let low = policy.decide_with_jitter(1, FailureClass::Transient, 0.0);
        let mid = policy.decide_with_jitter(1, FailureClass::Transient, 0.5);
        let high = policy.decide_with_jitter(1, FailureClass::Transient, 1.0);
        assert_eq!(low, RetryDecision::Retry(Duration::from_millis(75)));
        assert_eq!(mid, RetryDecision::Retry(Duration::from_millis(100)));
        assert_eq!(high, RetryDecision::Retry(Duration::from_millis(125)));
    }

    proptest! {
        // Simulates an operation retried as soon as it becomes eligible and
        // failing transiently every time.
        #[test]
        fn test_next_eligible_is_strictly_increasing(
            max_attempts in 1u32..12,
            samples in proptest::collection::vec(0.0f64..=1.0, 12),
        ) {
            let policy = policy(max_attempts, 0.5);
            let mut eligible_at = Duration::ZERO;
            let mut attempts = 0;

            loop {
                attempts += 1;
                let sample = samples[(attempts as usize - 1) % samples.len()];
                match policy.decide_with_jitter(attempts, FailureClass::Transient, sample) {
                    RetryDecision::Retry(delay) => {
                        let next = eligible_at + delay;
                        prop_assert!(next > eligible_at);
                        eligible_at = next;
                    }
                    RetryDecision::DeadLetter => break,
                }
            }

            prop_assert_eq!(attempts, max_attempts);
            // once dead-lettered, the decision never flips back
            prop_assert_eq!(
                policy.decide_with_jitter(attempts + 1, FailureClass::Transient, 0.5),
                RetryDecision::DeadLetter
            );
        }
    }
}
