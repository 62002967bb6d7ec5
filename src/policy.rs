//! Retry budget and backoff schedule applied when a publish attempt fails.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff between publish attempts.
///
/// The delay before attempt `n + 1` (after `n` failures) is
/// `initial * multiplier^(n - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Backoff {
    /// No delay: a requeued record is claimable immediately.
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1,
            max: Duration::ZERO,
        }
    }

    pub const fn exponential(initial: Duration, multiplier: u32, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
        }
    }

    /// Delay to wait after the `retry_count`-th failure.
    pub fn delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1).saturating_pow(retry_count - 1);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 2, Duration::from_secs(300))
    }
}

/// Where a record goes after a failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `PENDING`, claimable again from `next_attempt_at`.
    Requeued {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Retry budget exhausted, the record is now `FAILED`.
    DeadLettered { retry_count: u32 },
    /// The record was not in flight (already terminal, pending or unknown); nothing changed.
    Ignored,
}

/// Bounded retry policy shared by the dispatcher and the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a record that already failed `retry_count` times may be claimed.
    pub fn allows_claim(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Transition for a record that failed once more, having failed
    /// `retry_count` times before.
    pub fn on_failure(&self, retry_count: u32, now: DateTime<Utc>) -> FailureOutcome {
        let retry_count = retry_count.saturating_add(1);
        if retry_count >= self.max_retries {
            return FailureOutcome::DeadLettered { retry_count };
        }
        let delay = chrono::Duration::from_std(self.backoff.delay(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        FailureOutcome::Requeued {
            retry_count,
            next_attempt_at: now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_RETRIES)
    }
}
