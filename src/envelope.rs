//! What the dispatcher hands to the message bus.
//!
//! An [`Envelope`] pairs routing metadata with a payload. For outbox records the
//! headers are [`EventHeaders`] and the payload is the record's JSON body; the
//! transport layers may later replace the payload with encoded bytes.
//!
//! ```rust
//! use outbox_relay::Envelope;
//!
//! let envelope: Envelope<_, _> = ("identity.account.created", 42).into();
//! assert_eq!(envelope.headers, "identity.account.created");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{LogicalDatabase, OutboxRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<H, M> {
    /// Message metadata.
    pub headers: H,
    /// Message payload.
    pub message: M,
}

impl<H, M> From<(H, M)> for Envelope<H, M> {
    fn from(value: (H, M)) -> Self {
        Envelope {
            headers: value.0,
            message: value.1,
        }
    }
}

/// Publish arguments of an outbox record.
///
/// `id` is stable across redeliveries and is the key consumers deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders {
    pub id: Uuid,
    pub database: LogicalDatabase,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    /// 1 for the first delivery attempt.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// The envelope published for an outbox record.
pub type EventEnvelope = Envelope<EventHeaders, serde_json::Value>;

impl OutboxRecord {
    /// Build the envelope handed to the transport for this record.
    pub fn envelope(&self, database: LogicalDatabase) -> EventEnvelope {
        Envelope {
            headers: EventHeaders {
                id: self.id,
                database,
                event_type: self.event_type.clone(),
                aggregate_type: self.aggregate_type.clone(),
                aggregate_id: self.aggregate_id.clone(),
                attempt: self.retry_count + 1,
                created_at: self.created_at,
            },
            message: self.payload.clone(),
        }
    }
}
