//! The outbox record and its lifecycle states.
//!
//! ```text
//! PENDING ──claim──► PROCESSING ──success──► COMPLETED
//!    ▲                   │
//!    └──retry (< max)────┤
//!                        └──retry (== max)──► FAILED
//! ```
//!
//! `COMPLETED` and `FAILED` are terminal. Completed records are eventually
//! purged by the janitor; failed records stay until an operator replays them.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery status of an outbox record.
///
/// Stored as upper-case text by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a backend holds a status string this crate does not know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseStatusError(String);

impl fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid outbox status `{}`", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

impl FromStr for OutboxStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseStatusError(other.to_owned())),
        }
    }
}

/// An event as supplied by business code, before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Kind of entity the event concerns, e.g. `ACCOUNT`.
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// Semantic event name, e.g. `identity.account.created`.
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl OutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    /// Build an event from any serializable payload.
    pub fn from_payload<P: Serialize + ?Sized>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            event_type,
            serde_json::to_value(payload)?,
        ))
    }
}

/// The unit of durable, at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Time-sortable UUIDv7 assigned by the writer.
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    /// Failed publish attempts so far. Only an operator replay lowers it.
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Earliest time the record may be claimed.
    pub next_attempt_at: DateTime<Utc>,
    /// Set while the record is `PROCESSING`.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Set when the record reaches `COMPLETED`.
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxRecord {
    /// A fresh `PENDING` record for `event`, claimable immediately.
    pub fn pending(event: OutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            aggregate_type: event.aggregate_type,
            aggregate_id: event.aggregate_id,
            event_type: event.event_type,
            payload: event.payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            next_attempt_at: now,
            claimed_at: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimable(&self, max_retries: u32, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.retry_count < max_retries
            && self.next_attempt_at <= now
    }

    /// A `PENDING` record that has no attempts left under `max_retries`.
    ///
    /// Happens when the retry budget is lowered after the record was requeued.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.status == OutboxStatus::Pending && self.retry_count >= max_retries
    }
}

/// Result of renewing the claims a dispatcher holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimRenewal {
    /// New `claimed_at` of every held record.
    pub claimed_at: DateTime<Utc>,
    /// Records still `PROCESSING` under the caller's claim.
    pub held: Vec<Uuid>,
}

impl ClaimRenewal {
    pub fn holds(&self, id: Uuid) -> bool {
        self.held.contains(&id)
    }
}

/// Per-status record counts of one outbox table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Processing => self.processing += count,
            OutboxStatus::Completed => self.completed += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }
}
