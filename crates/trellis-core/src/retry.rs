//! Retry policy
//!
//! Pure decision function over (attempt, error). Backoff doubles per attempt
//! from `base_delay_ms`, plus up to one base delay of random jitter, capped
//! at `max_delay_ms`.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::ErrorInfo;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_DELAY_MS: u64 = 5_000;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_true() -> bool {
    true
}

/// Retry configuration attached to a step or dispatch unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: true,
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after_ms: u64 },
    GiveUp,
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms.max(base_delay_ms);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Decide after `attempt` attempts (1-based) have failed with `error`.
    pub fn next_action(&self, attempt: u32, error: &ErrorInfo) -> RetryDecision {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        let jitter_ms = if self.jitter && self.base_delay_ms > 0 {
            rand::thread_rng().gen_range(0..self.base_delay_ms)
        } else {
            0
        };
        let after_ms = self
            .backoff_ms(attempt)
            .saturating_add(jitter_ms)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        RetryDecision::Retry { after_ms }
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        if self.base_delay_ms == 0 {
            return 0;
        }
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay_ms.saturating_mul(1u64 << shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ErrorInfo, ErrorKind};

    fn runtime() -> ErrorInfo {
        ErrorInfo::runtime("boom")
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let policy = RetryPolicy::default().with_max_attempts(5).without_jitter();
        assert_eq!(
            policy.next_action(1, &runtime()),
            RetryDecision::Retry { after_ms: 200 }
        );
        assert_eq!(
            policy.next_action(2, &runtime()),
            RetryDecision::Retry { after_ms: 400 }
        );
        assert_eq!(
            policy.next_action(3, &runtime()),
            RetryDecision::Retry { after_ms: 800 }
        );
    }

    #[test]
    fn test_gives_up_at_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(matches!(policy.next_action(2, &runtime()), RetryDecision::Retry { .. }));
        assert_eq!(policy.next_action(3, &runtime()), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy::none().next_action(1, &runtime()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_non_retryable_errors_give_up_immediately() {
        let policy = RetryPolicy::default().with_max_attempts(10);
        for kind in [
            ErrorKind::SecurityViolation,
            ErrorKind::UnknownTool,
            ErrorKind::InvalidInput,
            ErrorKind::PermissionDenied,
            ErrorKind::UnresolvedReference,
        ] {
            assert_eq!(
                policy.next_action(1, &ErrorInfo::new(kind, "x")),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn test_jitter_stays_within_one_base_delay() {
        let policy = RetryPolicy::default().with_max_attempts(5);
        for _ in 0..50 {
            match policy.next_action(2, &runtime()) {
                RetryDecision::Retry { after_ms } => assert!((400..600).contains(&after_ms)),
                RetryDecision::GiveUp => panic!("expected retry"),
            }
        }
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default()
            .with_max_attempts(30)
            .with_delays(1_000, 3_000);
        match policy.next_action(10, &runtime()) {
            RetryDecision::Retry { after_ms } => assert_eq!(after_ms, 3_000),
            RetryDecision::GiveUp => panic!("expected retry"),
        }
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 2}"#).expect("policy");
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert!(policy.jitter);
    }
}
