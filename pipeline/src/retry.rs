//! Error classification and backoff policy for analyzer attempts.
//!
//! Every analyzer failure is classified into a [`RetryCategory`] so the
//! orchestrator can decide retry vs. terminal without string matching.
//!
//! | Category      | Retriable | Notes                                  |
//! |---------------|-----------|----------------------------------------|
//! | Transient     | yes       | timeout, 5xx, connection errors        |
//! | RateLimit     | yes       | honors the server's `retry_after` hint |
//! | SchemaFailure | no*       | one strict re-prompt happens inside the analyzer |
//! | Configuration | no        | unknown task / missing model — fatal   |
//! | Auth          | no        | credentials problem — fatal            |
//! | Cancelled     | no        | run cancelled from above               |
//!
//! `*` schema failures consume their single re-prompt before surfacing, so
//! by the time the orchestrator sees one the kind is terminal.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCategory {
    /// Transient transport failure — retry with backoff.
    Transient,
    /// Model API rate limit — retry, preferring the server's hint.
    RateLimit,
    /// Model output failed schema validation after the strict re-prompt.
    SchemaFailure,
    /// Unknown task, missing model id — operator error, never retried.
    Configuration,
    /// Credential rejection — never retried.
    Auth,
    /// Cancelled by the caller — terminal for this run.
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::SchemaFailure => "schema_failure",
            Self::Configuration => "configuration",
            Self::Auth => "auth",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Exponential backoff with full jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per kind, including the first (default 3).
    pub max_attempts: u32,
    /// First backoff ceiling (default 1s).
    pub base_delay: Duration,
    /// Backoff cap (default 30s).
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt numbered `next_attempt` (1-based; the
    /// first retry is attempt 2). Full jitter over the exponential ceiling;
    /// a `retry_after` hint from the server wins when it is larger.
    pub fn delay_before(&self, next_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = next_attempt.saturating_sub(2).min(16);
        let ceiling = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jittered = Duration::from_millis(
            rand::rng().random_range(0..=ceiling.as_millis().max(1) as u64),
        );
        match retry_after {
            Some(hint) if hint > jittered => hint.min(self.max_delay),
            _ => jittered,
        }
    }

    /// Whether another attempt is allowed after `attempts_so_far` have run.
    pub fn allows_another(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}
