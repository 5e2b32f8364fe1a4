//! Retry and backoff policy for WAL records
//!
//! `RetryPolicy::next_state` is a pure function of the attempt count and
//! the write outcome, so the whole retry ladder is testable without a store.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::SyncConfig;

use super::wal::WalState;

/// Result of one graph write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Succeeded,
    Failed,
}

/// Where a record goes after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextState {
    pub state: WalState,
    /// Earliest time a FAILED record may be retried
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retrying after `attempt` failures: `base * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Whether a record with this many attempts may be dispatched again
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }

    /// Next state of a record that has made `attempt_count` attempts
    pub fn next_state(&self, attempt_count: u32, outcome: WriteOutcome, now: DateTime<Utc>) -> NextState {
        match outcome {
            WriteOutcome::Succeeded => NextState {
                state: WalState::Committed,
                next_attempt_at: None,
            },
            WriteOutcome::Failed if self.is_exhausted(attempt_count) => NextState {
                state: WalState::DeadLetter,
                next_attempt_at: None,
            },
            WriteOutcome::Failed => {
                let delay = chrono::Duration::from_std(self.backoff(attempt_count))
                    .unwrap_or_else(|_| chrono::Duration::MAX);
                NextState {
                    state: WalState::Failed,
                    next_attempt_at: Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)),
                }
            }
        }
    }
}
