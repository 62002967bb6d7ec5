//! Outbox storage abstractions and the [`Outbox`] façade.
//!
//! Business code appends events with [`Outbox::publish`] inside the transaction
//! that mutates its own state. Background workers later claim, settle, inspect
//! and purge those records through the same façade.
//!
//! Storage is split into small capability traits implemented by each backend:
//!
//! - [`InsertRecords`] / [`BeginTransaction`]: transactional writes
//! - [`ClaimRecords`]: atomic `PENDING -> PROCESSING` claims and the stuck-claim reaper
//! - [`SettleRecords`]: recording publish outcomes
//! - [`InspectRecords`]: lookups, stats and dead letters
//! - [`MaintainRecords`]: retention cleanup and dead-letter replay
//!
//! Each [`LogicalDatabase`] is registered with its own store. An operation only
//! ever touches the store of the database it names.
//!
//! Backends are provided by [`inmemory`] and, behind the `sqlx` feature, [`sqlx`].

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use tracing::instrument;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    ClaimRenewal, FailureOutcome, LogicalDatabase, OutboxEvent, OutboxRecord, OutboxStats, RetryPolicy,
};

/// Error returned by outbox operations.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Outbox errors kind.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The database has no store registered with this outbox.
    UnknownDatabase(LogicalDatabase),
    /// Errors originating from the storage backend.
    Backend(tower::BoxError),
}

impl OutboxError {
    fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::Backend(err.into()),
        }
    }

    fn unknown_database(database: LogicalDatabase) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: OutboxErrorKind::UnknownDatabase(database),
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::UnknownDatabase(db) => {
                writeln!(f, "No outbox registered for database `{db}`")
            }
            OutboxErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::UnknownDatabase(_) => None,
            OutboxErrorKind::Backend(err) => Some(err.as_ref()),
        }
    }
}

/// Base trait of every storage capability.
pub trait OutboxBackend: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Current time according to the backend's clock.
    fn now(&self) -> DateTime<Utc>;
}

/// Insert records inside a caller-owned transaction.
///
/// Inserted records become visible to claimers only once the transaction
/// commits, and disappear with it on rollback.
#[async_trait::async_trait]
pub trait InsertRecords: OutboxBackend {
    /// Transaction type used for atomic insertion.
    type Transaction<'a>: Send;

    /// Insert a batch of records. Either all of them are staged or none.
    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error>;
}

/// Open and commit transactions owned by the outbox itself.
#[async_trait::async_trait]
pub trait BeginTransaction: InsertRecords {
    async fn begin(&self) -> Result<Self::Transaction<'static>, Self::Error>;

    async fn commit(&self, tx: Self::Transaction<'static>) -> Result<(), Self::Error>;
}

/// Claim records for dispatch.
#[async_trait::async_trait]
pub trait ClaimRecords: OutboxBackend {
    /// Atomically move up to `limit` eligible `PENDING` records to `PROCESSING`
    /// and return them oldest first.
    ///
    /// A record is eligible when `retry_count < max_retries` and its
    /// `next_attempt_at` has passed. Records claimed concurrently by another
    /// worker are skipped, so fewer than `limit` may be returned.
    ///
    /// `PENDING` records that already used `max_retries` attempts are moved to
    /// `FAILED` on the way, so lowering the budget never strands them.
    async fn claim_pending(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<OutboxRecord>, Self::Error>;

    /// Conditional `PENDING -> PROCESSING` update of a single record.
    ///
    /// Returns `false` if the record was not pending (someone else won).
    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, Self::Error>;

    /// Restart the claim timeout of the records in `ids` that are still
    /// `PROCESSING` with `claimed_at` equal to `claimed_at`.
    ///
    /// Records reclaimed or settled since are left alone and missing from
    /// [`ClaimRenewal::held`].
    async fn renew_claims(
        &self,
        ids: &[Uuid],
        claimed_at: DateTime<Utc>,
    ) -> Result<ClaimRenewal, Self::Error>;

    /// Treat claims older than `claim_timeout` as failed attempts.
    ///
    /// Returns the number of records moved out of `PROCESSING`.
    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<u64, Self::Error>;
}

/// Record the outcome of a publish attempt.
#[async_trait::async_trait]
pub trait SettleRecords: OutboxBackend {
    /// Move a `PROCESSING` (or reclaimed `PENDING`) record to `COMPLETED`.
    ///
    /// Terminal and unknown records are left untouched and `false` is returned.
    async fn mark_as_completed(&self, id: Uuid) -> Result<bool, Self::Error>;

    /// Count a failed attempt on a `PROCESSING` record and requeue or
    /// dead-letter it according to `policy`.
    async fn mark_as_failed(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, Self::Error>;
}

/// Read-only access for operational tooling.
#[async_trait::async_trait]
pub trait InspectRecords: OutboxBackend {
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, Self::Error>;

    async fn stats(&self) -> Result<OutboxStats, Self::Error>;

    /// `FAILED` records, oldest first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, Self::Error>;
}

/// Retention cleanup and manual replay.
#[async_trait::async_trait]
pub trait MaintainRecords: OutboxBackend {
    /// Delete `COMPLETED` records processed more than `older_than` ago.
    ///
    /// Records in any other status are never deleted.
    async fn cleanup_completed(&self, older_than: chrono::Duration) -> Result<u64, Self::Error>;

    /// Return a `FAILED` record to `PENDING` with a fresh retry budget.
    async fn replay(&self, id: Uuid) -> Result<bool, Self::Error>;
}

/// Every capability the outbox needs from a backend.
pub trait OutboxStore:
    InsertRecords + ClaimRecords + SettleRecords + InspectRecords + MaintainRecords
{
}

impl<T> OutboxStore for T where
    T: InsertRecords + ClaimRecords + SettleRecords + InspectRecords + MaintainRecords
{
}

/// High-level façade over the outbox stores of several logical databases.
///
/// Cloning an `Outbox` clones the store handles, which share their
/// underlying storage.
#[derive(Clone)]
pub struct Outbox<S> {
    stores: BTreeMap<LogicalDatabase, S>,
    policy: RetryPolicy,
}

impl<S> Default for Outbox<S> {
    fn default() -> Self {
        Self {
            stores: BTreeMap::new(),
            policy: RetryPolicy::default(),
        }
    }
}

impl<S> Outbox<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the store backing `database`'s outbox table.
    pub fn with_database(mut self, database: LogicalDatabase, store: S) -> Self {
        self.stores.insert(database, store);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Registered databases, in a stable order.
    pub fn databases(&self) -> impl Iterator<Item = LogicalDatabase> + '_ {
        self.stores.keys().copied()
    }

    /// The store registered for `database`.
    pub fn store(&self, database: LogicalDatabase) -> Result<&S, OutboxError> {
        self.stores
            .get(&database)
            .ok_or_else(|| OutboxError::unknown_database(database))
    }
}

impl<S> Outbox<S>
where
    S: InsertRecords,
{
    /// Append one event to `database`'s outbox inside `tx`.
    ///
    /// Nothing is sent now; delivery happens once the transaction commits and a
    /// dispatcher claims the record. The returned record is exactly what was
    /// written, including its id.
    #[instrument(skip(self, event, tx), fields(event_type = %event.event_type))]
    pub async fn publish(
        &self,
        database: LogicalDatabase,
        event: OutboxEvent,
        tx: &mut S::Transaction<'_>,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut records = self.publish_batch(database, [event], tx).await?;
        records.pop().ok_or_else(|| {
            OutboxError::backend("backend returned no record for a single publish")
        })
    }

    /// Append several events to `database`'s outbox inside `tx`, all or none.
    #[instrument(skip(self, events, tx))]
    pub async fn publish_batch(
        &self,
        database: LogicalDatabase,
        events: impl IntoIterator<Item = OutboxEvent>,
        tx: &mut S::Transaction<'_>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let store = self.store(database)?;
        let now = store.now();
        let records: Vec<OutboxRecord> = events
            .into_iter()
            .map(|event| OutboxRecord::pending(event, now))
            .collect();

        store
            .insert_records(records.clone(), tx)
            .await
            .map_err(OutboxError::backend)?;

        tracing::debug!(count = records.len(), "Events staged in outbox");
        Ok(records)
    }
}

impl<S> Outbox<S>
where
    S: BeginTransaction,
{
    /// Append several events in a transaction opened and committed by the
    /// outbox, for callers without an ambient transaction.
    #[instrument(skip(self, events))]
    pub async fn publish_batch_atomic(
        &self,
        database: LogicalDatabase,
        events: impl IntoIterator<Item = OutboxEvent>,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        let store = self.store(database)?;
        let mut tx = store.begin().await.map_err(OutboxError::backend)?;
        let records = self.publish_batch(database, events, &mut tx).await?;
        store.commit(tx).await.map_err(OutboxError::backend)?;
        Ok(records)
    }
}

impl<S> Outbox<S>
where
    S: ClaimRecords,
{
    /// Claim up to `limit` eligible records of `database`, oldest first.
    ///
    /// Returns an empty list when nothing is eligible.
    #[instrument(skip(self))]
    pub async fn claim_pending(
        &self,
        database: LogicalDatabase,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store(database)?
            .claim_pending(limit, self.policy.max_retries)
            .await
            .map_err(OutboxError::backend)
    }

    #[instrument(skip(self))]
    pub async fn mark_as_processing(
        &self,
        database: LogicalDatabase,
        id: Uuid,
    ) -> Result<bool, OutboxError> {
        self.store(database)?
            .mark_as_processing(id)
            .await
            .map_err(OutboxError::backend)
    }

    /// Keep the claims on `ids` alive while the caller works through them.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn renew_claims(
        &self,
        database: LogicalDatabase,
        ids: &[Uuid],
        claimed_at: DateTime<Utc>,
    ) -> Result<ClaimRenewal, OutboxError> {
        if ids.is_empty() {
            return Ok(ClaimRenewal {
                claimed_at,
                held: Vec::new(),
            });
        }
        self.store(database)?
            .renew_claims(ids, claimed_at)
            .await
            .map_err(OutboxError::backend)
    }

    /// Return claims older than `claim_timeout` to the retry cycle.
    #[instrument(skip(self))]
    pub async fn reclaim_expired(
        &self,
        database: LogicalDatabase,
        claim_timeout: Duration,
    ) -> Result<u64, OutboxError> {
        self.store(database)?
            .reclaim_expired(claim_timeout, &self.policy)
            .await
            .map_err(OutboxError::backend)
    }
}

impl<S> Outbox<S>
where
    S: SettleRecords,
{
    #[instrument(skip(self))]
    pub async fn mark_as_completed(
        &self,
        database: LogicalDatabase,
        id: Uuid,
    ) -> Result<bool, OutboxError> {
        self.store(database)?
            .mark_as_completed(id)
            .await
            .map_err(OutboxError::backend)
    }

    #[instrument(skip(self))]
    pub async fn mark_as_failed(
        &self,
        database: LogicalDatabase,
        id: Uuid,
        error: &str,
    ) -> Result<FailureOutcome, OutboxError> {
        self.store(database)?
            .mark_as_failed(id, error, &self.policy)
            .await
            .map_err(OutboxError::backend)
    }
}

impl<S> Outbox<S>
where
    S: InspectRecords,
{
    #[instrument(skip(self))]
    pub async fn find(
        &self,
        database: LogicalDatabase,
        id: Uuid,
    ) -> Result<Option<OutboxRecord>, OutboxError> {
        self.store(database)?
            .find(id)
            .await
            .map_err(OutboxError::backend)
    }

    /// Per-status counts of `database`'s outbox, for dashboards and alerting.
    #[instrument(skip(self))]
    pub async fn stats(&self, database: LogicalDatabase) -> Result<OutboxStats, OutboxError> {
        self.store(database)?
            .stats()
            .await
            .map_err(OutboxError::backend)
    }

    #[instrument(skip(self))]
    pub async fn dead_letters(
        &self,
        database: LogicalDatabase,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, OutboxError> {
        self.store(database)?
            .dead_letters(limit)
            .await
            .map_err(OutboxError::backend)
    }
}

impl<S> Outbox<S>
where
    S: MaintainRecords,
{
    /// Delete completed records of `database` processed more than
    /// `older_than_days` ago. Returns the number of deleted records.
    #[instrument(skip(self))]
    pub async fn cleanup_completed(
        &self,
        database: LogicalDatabase,
        older_than_days: u32,
    ) -> Result<u64, OutboxError> {
        self.store(database)?
            .cleanup_completed(chrono::Duration::days(i64::from(older_than_days)))
            .await
            .map_err(OutboxError::backend)
    }

    /// Operator action: give a dead-lettered record a fresh retry budget.
    ///
    /// Returns `false` if the record is not `FAILED`.
    #[instrument(skip(self))]
    pub async fn replay_dead_letter(
        &self,
        database: LogicalDatabase,
        id: Uuid,
    ) -> Result<bool, OutboxError> {
        let replayed = self
            .store(database)?
            .replay(id)
            .await
            .map_err(OutboxError::backend)?;
        if replayed {
            tracing::info!(%database, record_id = %id, "Dead letter replayed");
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{Backoff, ManualClock, OutboxStatus, outbox::inmemory::InMemoryOutboxStore};

    fn account_created(id: &str) -> OutboxEvent {
        OutboxEvent::new(
            "ACCOUNT",
            id,
            "identity.account.created",
            json!({ "email": "x@y.com" }),
        )
    }

    fn outbox_with(clock: &ManualClock) -> Outbox<InMemoryOutboxStore> {
        Outbox::new()
            .with_policy(RetryPolicy::new(3).with_backoff(Backoff::none()))
            .with_database(
                LogicalDatabase::Identity,
                InMemoryOutboxStore::with_clock(clock.clone()),
            )
            .with_database(
                LogicalDatabase::Auth,
                InMemoryOutboxStore::with_clock(clock.clone()),
            )
            .with_database(
                LogicalDatabase::Legal,
                InMemoryOutboxStore::with_clock(clock.clone()),
            )
    }

    #[tokio::test]
    async fn committed_publish_leaves_a_pending_record() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);
        let store = outbox.store(LogicalDatabase::Identity).unwrap();

        let mut tx = store.begin().await.unwrap();
        let record = outbox
            .publish(LogicalDatabase::Identity, account_created("a1"), &mut tx)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let stored = outbox
            .find(LogicalDatabase::Identity, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, record);
        assert_eq!(stored.status, OutboxStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn rolled_back_publish_leaves_nothing() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);
        let store = outbox.store(LogicalDatabase::Identity).unwrap();

        let mut tx = store.begin().await.unwrap();
        let record = outbox
            .publish(LogicalDatabase::Identity, account_created("a1"), &mut tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(
            outbox.find(LogicalDatabase::Identity, record.id).await.unwrap(),
            None
        );
        assert_eq!(
            outbox.stats(LogicalDatabase::Identity).await.unwrap().total(),
            0
        );
    }

    #[tokio::test]
    async fn batch_publish_claims_oldest_first() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);

        let records = outbox
            .publish_batch_atomic(
                LogicalDatabase::Identity,
                ["a1", "a2", "a3"].map(account_created),
            )
            .await
            .unwrap();
        assert_ne!(records[0].id, records[1].id);
        assert_ne!(records[1].id, records[2].id);
        assert_ne!(records[0].id, records[2].id);

        let claimed = outbox
            .claim_pending(LogicalDatabase::Identity, 2)
            .await
            .unwrap();

        let ids: Vec<_> = claimed.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![records[0].id, records[1].id]);
        assert!(claimed.iter().all(|r| r.status == OutboxStatus::Processing));
    }

    #[tokio::test]
    async fn claims_follow_creation_order_across_transactions() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);

        let older = outbox
            .publish_batch_atomic(LogicalDatabase::Identity, [account_created("old")])
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(1));
        let newer = outbox
            .publish_batch_atomic(LogicalDatabase::Identity, [account_created("new")])
            .await
            .unwrap();

        let claimed = outbox
            .claim_pending(LogicalDatabase::Identity, 10)
            .await
            .unwrap();

        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, older[0].id);
        assert_eq!(claimed[1].id, newer[0].id);
    }

    #[tokio::test]
    async fn scenario_three_failures_dead_letter_the_record() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);
        let db = LogicalDatabase::Identity;

        outbox
            .publish_batch_atomic(db, [account_created("a1")])
            .await
            .unwrap();

        let claimed = outbox.claim_pending(db, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OutboxStatus::Processing);
        let id = claimed[0].id;

        outbox.mark_as_failed(db, id, "broker down").await.unwrap();
        assert_eq!(outbox.claim_pending(db, 10).await.unwrap().len(), 1);
        let outcome = outbox.mark_as_failed(db, id, "broker down").await.unwrap();
        assert!(matches!(
            outcome,
            FailureOutcome::Requeued { retry_count: 2, .. }
        ));

        let record = outbox.find(db, id).await.unwrap().unwrap();
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.status, OutboxStatus::Pending);

        assert_eq!(outbox.claim_pending(db, 10).await.unwrap().len(), 1);
        let outcome = outbox.mark_as_failed(db, id, "broker down").await.unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { retry_count: 3 });

        let record = outbox.find(db, id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.last_error.as_deref(), Some("broker down"));

        assert_eq!(
            outbox.stats(db).await.unwrap(),
            OutboxStats {
                pending: 0,
                processing: 0,
                completed: 0,
                failed: 1,
            }
        );
        assert!(outbox.claim_pending(db, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_records_ignore_further_settlement() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);
        let db = LogicalDatabase::Identity;

        outbox
            .publish_batch_atomic(db, [account_created("a1")])
            .await
            .unwrap();
        let id = outbox.claim_pending(db, 1).await.unwrap()[0].id;
        assert!(outbox.mark_as_completed(db, id).await.unwrap());
        let completed = outbox.find(db, id).await.unwrap().unwrap();

        clock.advance(chrono::Duration::minutes(5));
        assert!(!outbox.mark_as_completed(db, id).await.unwrap());
        assert_eq!(
            outbox.mark_as_failed(db, id, "late failure").await.unwrap(),
            FailureOutcome::Ignored
        );

        let after = outbox.find(db, id).await.unwrap().unwrap();
        assert_eq!(after.processed_at, completed.processed_at);
        assert_eq!(after.retry_count, 0);
        assert_eq!(after.status, OutboxStatus::Completed);
    }

    #[tokio::test]
    async fn dead_letters_stay_dead_until_replayed() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock).with_policy(RetryPolicy::new(1));
        let db = LogicalDatabase::Auth;

        outbox
            .publish_batch_atomic(db, [account_created("a1")])
            .await
            .unwrap();
        let id = outbox.claim_pending(db, 1).await.unwrap()[0].id;
        outbox.mark_as_failed(db, id, "rejected").await.unwrap();

        assert!(!outbox.mark_as_completed(db, id).await.unwrap());
        assert_eq!(
            outbox.find(db, id).await.unwrap().unwrap().retry_count,
            1
        );
        assert_eq!(outbox.dead_letters(db, 10).await.unwrap().len(), 1);

        assert!(outbox.replay_dead_letter(db, id).await.unwrap());
        assert!(!outbox.replay_dead_letter(db, id).await.unwrap());

        let replayed = outbox.find(db, id).await.unwrap().unwrap();
        assert_eq!(replayed.status, OutboxStatus::Pending);
        assert_eq!(replayed.retry_count, 0);
        assert_eq!(replayed.last_error, None);
        assert_eq!(outbox.claim_pending(db, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn retention_only_purges_old_completed_records() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock).with_policy(RetryPolicy::new(1));
        let db = LogicalDatabase::Legal;

        let records = outbox
            .publish_batch_atomic(db, ["done", "dead", "busy", "waiting"].map(account_created))
            .await
            .unwrap();
        let claimed = outbox.claim_pending(db, 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        outbox.mark_as_completed(db, records[0].id).await.unwrap();
        outbox.mark_as_failed(db, records[1].id, "nope").await.unwrap();

        clock.advance(chrono::Duration::days(8));
        outbox
            .publish_batch_atomic(db, [account_created("fresh")])
            .await
            .unwrap();
        let fresh = outbox.claim_pending(db, 10).await.unwrap();
        let fresh_id = fresh
            .iter()
            .find(|r| r.aggregate_id == "fresh")
            .map(|r| r.id)
            .unwrap();
        outbox.mark_as_completed(db, fresh_id).await.unwrap();

        assert_eq!(outbox.cleanup_completed(db, 7).await.unwrap(), 1);
        assert_eq!(outbox.cleanup_completed(db, 7).await.unwrap(), 0);

        assert_eq!(outbox.find(db, records[0].id).await.unwrap(), None);
        for id in [records[1].id, records[2].id, records[3].id, fresh_id] {
            assert!(outbox.find(db, id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn databases_are_isolated() {
        let clock = ManualClock::default();
        let outbox = outbox_with(&clock);

        outbox
            .publish_batch_atomic(LogicalDatabase::Identity, [account_created("a1")])
            .await
            .unwrap();

        for db in [LogicalDatabase::Auth, LogicalDatabase::Legal] {
            assert_eq!(outbox.stats(db).await.unwrap().total(), 0);
            assert!(outbox.claim_pending(db, 10).await.unwrap().is_empty());
        }
        assert_eq!(
            outbox
                .stats(LogicalDatabase::Identity)
                .await
                .unwrap()
                .pending,
            1
        );
    }

    #[tokio::test]
    async fn unregistered_database_is_an_error() {
        let outbox: Outbox<InMemoryOutboxStore> = Outbox::new().with_database(
            LogicalDatabase::Identity,
            InMemoryOutboxStore::default(),
        );

        let err = outbox.stats(LogicalDatabase::Legal).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            OutboxErrorKind::UnknownDatabase(LogicalDatabase::Legal)
        ));
    }

    #[tokio::test]
    async fn expired_claims_count_as_failed_attempts() {
        let clock = ManualClock::new(Utc::now());
        let outbox = outbox_with(&clock);
        let db = LogicalDatabase::Identity;

        outbox
            .publish_batch_atomic(db, [account_created("a1")])
            .await
            .unwrap();
        let id = outbox.claim_pending(db, 1).await.unwrap()[0].id;

        assert_eq!(
            outbox
                .reclaim_expired(db, Duration::from_secs(60))
                .await
                .unwrap(),
            0
        );
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(
            outbox
                .reclaim_expired(db, Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );

        let record = outbox.find(db, id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.claimed_at, None);
        assert_eq!(record.last_error.as_deref(), Some("claim expired after 60s"));
    }
}
