//! Reconnect policy
//!
//! Exponential backoff with an optional jitter band and an attempt ceiling.
//! `next_delay(n) = min(base_delay * multiplier^n, max_delay)`.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Reconnect policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts allowed before the manager reports a terminal failure
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles every attempt)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
            jitter_factor: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Create a new policy builder
    pub fn builder() -> ReconnectPolicyBuilder {
        ReconnectPolicyBuilder::new()
    }

    /// Delay to wait before retry number `attempt_count` (zero based)
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter && self.jitter_factor > 0.0 {
            let jitter_range = capped_ms * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_ms + jitter).clamp(0.0, self.max_delay.as_millis() as f64)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Whether another automatic attempt is allowed after `attempt_count` failures
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Max attempts must be greater than 0".to_string());
        }

        if self.base_delay.is_zero() {
            return Err("Base delay must be greater than 0".to_string());
        }

        if self.max_delay < self.base_delay {
            return Err("Max delay must be greater than or equal to base delay".to_string());
        }

        if self.backoff_multiplier <= 1.0 || !self.backoff_multiplier.is_finite() {
            return Err("Backoff multiplier must be greater than 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("Jitter factor must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}

/// Builder for ReconnectPolicy
pub struct ReconnectPolicyBuilder {
    policy: ReconnectPolicy,
}

impl ReconnectPolicyBuilder {
    pub fn new() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.policy.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> ReconnectPolicy {
        self.policy
    }
}

impl Default for ReconnectPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection-loss history used to drive the policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconnectAttempt {
    pub count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_reason: Option<String>,
}

impl ReconnectAttempt {
    /// Record a failed connection (closed by error)
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.count += 1;
        self.last_failure_at = Some(Utc::now());
        self.last_reason = Some(reason.into());
    }

    /// Called on every successful Open transition
    pub fn reset(&mut self) {
        self.count = 0;
        self.last_failure_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays_double_until_cap() {
        let policy = ReconnectPolicy::default();

        let delays: Vec<u64> = (0..6).map(|n| policy.next_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_ceiling() {
        let policy = ReconnectPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = ReconnectPolicy::builder()
            .with_jitter(true)
            .jitter_factor(0.5)
            .build();

        for _ in 0..100 {
            let delay = policy.next_delay(1);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_huge_attempt_count_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectPolicy::default().validate().is_ok());
        assert!(ReconnectPolicy::builder().max_attempts(0).build().validate().is_err());
        assert!(ReconnectPolicy::builder()
            .max_delay(Duration::from_millis(10))
            .build()
            .validate()
            .is_err());
        assert!(ReconnectPolicy::builder().backoff_multiplier(1.0).build().validate().is_err());
    }

    #[test]
    fn test_attempt_history_resets() {
        let mut attempt = ReconnectAttempt::default();
        attempt.record_failure("abnormal closure");
        attempt.record_failure("abnormal closure");
        assert_eq!(attempt.count, 2);
        assert!(attempt.last_failure_at.is_some());

        attempt.reset();
        assert_eq!(attempt.count, 0);
        assert!(attempt.last_failure_at.is_none());
        assert_eq!(attempt.last_reason.as_deref(), Some("abnormal closure"));
    }
}
