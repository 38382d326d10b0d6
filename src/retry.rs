use std::time::Duration;

/// Exponential backoff between reconnect attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub backoff: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_secs(1),
            backoff: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// `initial_delay * backoff^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.min(64) as i32);
        let cap = self.max_delay.as_millis() as f64;
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(cap);
        Duration::from_millis(millis.round() as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            backoff: 2.0,
            max_delay: Duration::from_millis(250),
        }
    }

    #[test]
    fn test_delays_double_until_capped() {
        let policy = policy(Some(3));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_millis(250));
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_below_one_does_not_shrink() {
        let policy = RetryPolicy {
            backoff: 0.5,
            ..policy(None)
        };
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(100));
    }

    #[test]
    fn test_attempt_limits() {
        let bounded = policy(Some(2));
        assert!(bounded.should_retry(0));
        assert!(bounded.should_retry(1));
        assert!(!bounded.should_retry(2));

        assert!(!policy(Some(0)).should_retry(0));
        assert!(policy(None).should_retry(10_000));
    }
}
