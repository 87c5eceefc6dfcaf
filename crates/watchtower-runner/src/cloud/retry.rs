//! Backoff for transient gateway failures

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Linear backoff: `initial`, `initial + increment`, ... capped at `max`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_increment")]
    pub increment_secs: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    4
}

fn default_increment() -> u64 {
    10
}

fn default_max_delay() -> u64 {
    100
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            increment_secs: default_increment(),
            max_delay_secs: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let steps = u64::from(retry.saturating_sub(1));
        let secs = self
            .initial_delay_secs
            .saturating_add(self.increment_secs.saturating_mul(steps))
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Whether another attempt follows attempt number `attempt` (1-based)
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_with_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(14));
        assert_eq!(policy.delay(3), Duration::from_secs(24));
        assert_eq!(policy.delay(20), Duration::from_secs(100));
    }

    #[test]
    fn test_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert!(!RetryPolicy::none().allows_retry(1));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_secs, 4);
    }
}
