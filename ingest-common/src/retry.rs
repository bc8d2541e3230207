//! # Retry
//!
//! Backoff between redeliveries of a message that failed with a retryable error.
use std::time;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// The retry policy a consumer uses to decide how long to wait before redelivering a message.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Calculate the time to wait before redelivering a message that failed `attempt` times.
    /// The first failure is attempt 0.
    pub fn redelivery_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_redelivery_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let first_interval = retry_policy.redelivery_interval(0);
        let second_interval = retry_policy.redelivery_interval(1);
        let third_interval = retry_policy.redelivery_interval(2);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_redelivery_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(2))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();
        let first_interval = retry_policy.redelivery_interval(0);
        let second_interval = retry_policy.redelivery_interval(1);
        let third_interval = retry_policy.redelivery_interval(2);
        let fourth_interval = retry_policy.redelivery_interval(3);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(4));
        assert_eq!(third_interval, time::Duration::from_secs(4));
        assert_eq!(fourth_interval, time::Duration::from_secs(4));
    }

    #[test]
    fn test_redelivery_interval_saturates_after_many_attempts() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(100))
            .provide();

        assert_eq!(
            retry_policy.redelivery_interval(u32::MAX),
            time::Duration::from_secs(100)
        );
    }

    #[test]
    fn test_default_policy_doubles() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.redelivery_interval(0), time::Duration::from_secs(1));
        assert_eq!(retry_policy.redelivery_interval(3), time::Duration::from_secs(8));
    }
}
