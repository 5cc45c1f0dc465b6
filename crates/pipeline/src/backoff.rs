//! Exponential backoff between status polls.

use std::time::Duration;

/// Tunable parameters for the poll interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second observation.
    pub initial_interval: Duration,
    /// Upper bound on the delay between observations.
    pub max_interval: Duration,
    /// Factor by which the delay grows after each observation.
    pub multiplier: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            multiplier: 1.5,
        }
    }
}

impl PollPolicy {
    /// Check the policy can never busy-spin or shrink.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval.is_zero() {
            return Err("initial poll interval must be greater than 0".to_string());
        }
        if self.max_interval < self.initial_interval {
            return Err("max poll interval must be at least the initial interval".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "poll multiplier must be a finite number >= 1.0 (got {})",
                self.multiplier
            ));
        }
        Ok(())
    }
}

/// Calculate the next poll delay from the current delay and policy.
///
/// The result is clamped to [`PollPolicy::max_interval`].
pub fn next_delay(current: Duration, policy: &PollPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_interval)
}
