//! Retry policy for the command connection handshake
//!
//! `open_connection` travels over unreliable multicast, so the request is
//! re-sent a fixed number of times, each followed by a bounded wait for the
//! remote to dial in. TCP delivery after that is reliable and never retried.

use std::time::Duration;

/// Default number of `open_connection` attempts
pub const DEFAULT_HANDSHAKE_ATTEMPTS: u32 = 6;

/// Default wait after each attempt
pub const DEFAULT_HANDSHAKE_INTERVAL: Duration = Duration::from_secs(5);

/// Handshake retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePolicy {
    /// Number of `open_connection` requests to send
    pub attempts: u32,
    /// How long to wait for the remote after each request
    pub interval: Duration,
}

impl Default for HandshakePolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_HANDSHAKE_ATTEMPTS,
            interval: DEFAULT_HANDSHAKE_INTERVAL,
        }
    }
}

impl HandshakePolicy {
    /// Wait duration for zero-based `attempt`, or `None` once the budget is spent
    #[must_use]
    pub const fn wait_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < self.attempts {
            Some(self.interval)
        } else {
            None
        }
    }

    /// Total time spent waiting before the handshake gives up
    #[must_use]
    pub const fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = HandshakePolicy::default();
        assert_eq!(policy.attempts, 6);
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.budget(), Duration::from_secs(30));
    }

    #[test]
    fn every_attempt_within_budget_waits_the_interval() {
        let policy = HandshakePolicy::default();
        for attempt in 0..policy.attempts {
            assert_eq!(policy.wait_for_attempt(attempt), Some(policy.interval));
        }
    }

    #[test]
    fn stops_after_last_attempt() {
        let policy = HandshakePolicy {
            attempts: 2,
            interval: Duration::from_millis(10),
        };
        assert!(policy.wait_for_attempt(1).is_some());
        assert_eq!(policy.wait_for_attempt(2), None);
        assert_eq!(policy.wait_for_attempt(u32::MAX), None);
    }

    #[test]
    fn zero_attempts_never_waits() {
        let policy = HandshakePolicy {
            attempts: 0,
            interval: Duration::from_secs(1),
        };
        assert_eq!(policy.wait_for_attempt(0), None);
        assert_eq!(policy.budget(), Duration::ZERO);
    }

    #[test]
    fn budget_saturates() {
        let policy = HandshakePolicy {
            attempts: u32::MAX,
            interval: Duration::MAX,
        };
        assert_eq!(policy.budget(), Duration::MAX);
    }
}
