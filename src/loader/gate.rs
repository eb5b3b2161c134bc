// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Activity-gated retry policy.
//!
//! Downloads are never retried on a timer. The caller's activity pulses are
//! the only trigger, and this gate decides whether a given pulse may start
//! one: not before the backoff deadline, and never after the attempt budget
//! is spent.

use std::time::Duration;

use tokio::time::Instant;

use super::types::RetryPolicy;

/// What the gate says about an activity pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// A download may start now.
    Attempt,
    /// Too soon after the last failure.
    Throttled,
    /// No attempts left, ever.
    Exhausted,
}

/// Backoff deadline plus attempt counter for one loader.
#[derive(Debug, Clone)]
pub struct ActivityGate {
    policy: RetryPolicy,
    next_earliest_attempt: Instant,
    attempts_made: u32,
}

impl ActivityGate {
    /// A fresh gate that permits an attempt immediately.
    ///
    /// A `max_attempts` of zero is treated as one.
    pub fn new(mut policy: RetryPolicy, now: Instant) -> Self {
        policy.max_attempts = policy.max_attempts.max(1);
        Self {
            policy,
            next_earliest_attempt: now,
            attempts_made: 0,
        }
    }

    pub fn check(&self, now: Instant) -> GateDecision {
        if self.is_exhausted() {
            GateDecision::Exhausted
        } else if now < self.next_earliest_attempt {
            GateDecision::Throttled
        } else {
            GateDecision::Attempt
        }
    }

    /// Count a failed download and push the deadline out.
    ///
    /// Returns true if that was the last permitted attempt.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.attempts_made = (self.attempts_made + 1).min(self.policy.max_attempts);
        self.next_earliest_attempt = now + self.backoff_after(self.attempts_made);
        self.is_exhausted()
    }

    /// Delay imposed after the `failures`-th consecutive failure.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.policy
            .base_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.policy.max_backoff, |d| d.min(self.policy.max_backoff))
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.policy.max_attempts
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.policy.max_attempts - self.attempts_made
    }

    pub fn next_earliest_attempt(&self) -> Instant {
        self.next_earliest_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_fresh_gate_permits() {
        let now = Instant::now();
        let gate = ActivityGate::new(policy(3), now);
        assert_eq!(gate.check(now), GateDecision::Attempt);
        assert_eq!(gate.remaining_attempts(), 3);
    }

    #[test]
    fn test_failure_throttles_until_deadline() {
        let now = Instant::now();
        let mut gate = ActivityGate::new(policy(3), now);

        assert!(!gate.record_failure(now));
        assert_eq!(gate.check(now), GateDecision::Throttled);
        assert_eq!(gate.check(now + Duration::from_secs(9)), GateDecision::Throttled);
        assert_eq!(gate.check(now + Duration::from_secs(10)), GateDecision::Attempt);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let gate = ActivityGate::new(policy(10), Instant::now());
        assert_eq!(gate.backoff_after(1), Duration::from_secs(10));
        assert_eq!(gate.backoff_after(2), Duration::from_secs(20));
        assert_eq!(gate.backoff_after(3), Duration::from_secs(40));
        assert_eq!(gate.backoff_after(4), Duration::from_secs(60));
        assert_eq!(gate.backoff_after(40), Duration::from_secs(60));
    }

    #[test]
    fn test_budget_is_permanent() {
        let now = Instant::now();
        let mut gate = ActivityGate::new(policy(2), now);

        assert!(!gate.record_failure(now));
        assert!(gate.record_failure(now));
        assert_eq!(gate.attempts_made(), 2);

        let much_later = now + Duration::from_secs(3600);
        assert_eq!(gate.check(much_later), GateDecision::Exhausted);

        // Further failures never push the counter past the budget.
        gate.record_failure(much_later);
        assert_eq!(gate.attempts_made(), 2);
        assert_eq!(gate.remaining_attempts(), 0);
    }

    #[test]
    fn test_zero_budget_allows_one_attempt() {
        let now = Instant::now();
        let mut gate = ActivityGate::new(policy(0), now);
        assert_eq!(gate.check(now), GateDecision::Attempt);
        assert!(gate.record_failure(now));
    }
}
