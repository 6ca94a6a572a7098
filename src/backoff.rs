//! Reconnect back-off state.
//!
//! The delay starts at a floor, doubles after every failed reconnect and is
//! clamped at a ceiling. Only a successful reconnect resets it.

use std::time::Duration;

/// Delay before the first reconnect attempt.
pub const DEFAULT_FLOOR: Duration = Duration::from_secs(5);

/// Upper bound for the reconnect delay.
pub const DEFAULT_CEILING: Duration = Duration::from_secs(60);

/// Floor and ceiling of the reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub floor: Duration,
    pub ceiling: Duration,
}

impl BackoffPolicy {
    /// Create a policy; a ceiling below the floor is raised to the floor.
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// Delay after `failures` consecutive failed reconnects:
    /// `min(floor * 2^failures, ceiling)`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.floor
            .checked_mul(factor)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FLOOR, DEFAULT_CEILING)
    }
}

/// Reconnect delay tracker owned by the publish worker.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.floor,
            failures: 0,
        }
    }

    /// Delay to wait before the next reconnect attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Number of consecutive failed reconnects.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed reconnect and return the next delay.
    pub fn on_failure(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.policy.ceiling)
            .min(self.policy.ceiling);
        self.current
    }

    /// Record a successful reconnect.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.current = self.policy.floor;
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
