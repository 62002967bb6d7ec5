#![doc = include_str!("../README.md")]

pub mod clock;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod envelope;
pub mod janitor;
pub mod outbox;
pub mod poller;
pub mod policy;
pub mod record;
pub mod transport;

#[doc(inline)]
pub use clock::{Clock, ManualClock, SystemClock};

#[doc(inline)]
pub use config::{ConfigError, OutboxConfig};

#[doc(inline)]
pub use database::LogicalDatabase;

#[doc(inline)]
pub use dispatcher::{
    DefaultDispatchHook, DispatchError, DispatchErrorKind, DispatchHook, DispatchReport,
    DispatchSettings, Dispatcher,
};

#[doc(inline)]
pub use envelope::{Envelope, EventEnvelope, EventHeaders};

#[doc(inline)]
pub use janitor::{CleanupReport, Janitor};

#[doc(inline)]
pub use outbox::{Outbox, OutboxError, OutboxErrorKind, OutboxStore};

#[doc(inline)]
pub use policy::{Backoff, FailureOutcome, RetryPolicy};

#[doc(inline)]
pub use record::{ClaimRenewal, OutboxEvent, OutboxRecord, OutboxStats, OutboxStatus};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
