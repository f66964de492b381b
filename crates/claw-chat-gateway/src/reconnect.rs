//! Reconnection policy and exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries allowed without an intervening successful Ready.
    pub max_attempts: u32,
    /// Fixed delay used after an invalid-session notice, in milliseconds.
    pub invalid_session_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
            invalid_session_delay_ms: 2_500,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for the given attempt: `base * 2^(attempt - 1)`, capped at `max_delay_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Delay used after an invalid-session notice.
    #[must_use]
    pub const fn invalid_session_delay(&self) -> Duration {
        Duration::from_millis(self.invalid_session_delay_ms)
    }
}

/// What caused a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    /// Transport loss, server reconnect request, or missed heartbeat ack.
    Backoff,
    /// The server invalidated the session.
    InvalidSession,
}

/// Outcome of asking the policy for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Dial again after `delay`.
    Retry {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before dialing.
        delay: Duration,
    },
    /// No attempts left.
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Attempt counter driven by a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// Create a counter starting at zero.
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Current attempt count.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Register a reconnect trigger and decide whether to retry.
    pub fn next(&mut self, trigger: ReconnectTrigger) -> RetryDecision {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.policy.max_attempts {
            return RetryDecision::Exhausted {
                attempts: self.policy.max_attempts,
            };
        }

        let delay = match trigger {
            ReconnectTrigger::Backoff => self.policy.delay_for_attempt(self.attempt),
            ReconnectTrigger::InvalidSession => self.policy.invalid_session_delay(),
        };
        RetryDecision::Retry {
            attempt: self.attempt,
            delay,
        }
    }

    /// Reset after a successful Ready.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
