use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    ClaimRenewal, Clock, FailureOutcome, OutboxRecord, OutboxStats, OutboxStatus, RetryPolicy, SystemClock,
    outbox::{
        BeginTransaction, ClaimRecords, InsertRecords, InspectRecords, MaintainRecords,
        OutboxBackend, SettleRecords,
    },
};

/// An in-memory outbox table for tests or local usage.
///
/// Every operation runs under a single lock, which makes claims and failure
/// bookkeeping atomic. Writes go through an [`InMemoryTransaction`] and only
/// become visible on [`commit`](BeginTransaction::commit).
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    table: Arc<Mutex<Table>>,
    clock: Arc<dyn Clock>,
}

#[derive(Default)]
struct Table {
    rows: HashMap<Uuid, Row>,
    next_seq: u64,
}

/// `seq` preserves insertion order among records sharing a `created_at`.
struct Row {
    seq: u64,
    record: OutboxRecord,
}

impl Table {
    fn ordered<'a>(&'a self, mut filter: impl FnMut(&OutboxRecord) -> bool) -> Vec<&'a Row> {
        let mut rows: Vec<&Row> = self.rows.values().filter(|r| filter(&r.record)).collect();
        rows.sort_by_key(|r| (r.record.created_at, r.seq));
        rows
    }

    /// Apply a failed attempt to an in-flight row.
    fn fail(
        &mut self,
        id: Uuid,
        error: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> FailureOutcome {
        let Some(row) = self.rows.get_mut(&id) else {
            return FailureOutcome::Ignored;
        };
        let record = &mut row.record;
        if record.status != OutboxStatus::Processing {
            return FailureOutcome::Ignored;
        }

        let outcome = policy.on_failure(record.retry_count, now);
        match outcome {
            FailureOutcome::Requeued {
                retry_count,
                next_attempt_at,
            } => {
                record.status = OutboxStatus::Pending;
                record.retry_count = retry_count;
                record.next_attempt_at = next_attempt_at;
            }
            FailureOutcome::DeadLettered { retry_count } => {
                record.status = OutboxStatus::Failed;
                record.retry_count = retry_count;
            }
            FailureOutcome::Ignored => return outcome,
        }
        record.last_error = Some(error);
        record.claimed_at = None;
        record.updated_at = now;
        outcome
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            clock: Arc::new(clock),
        }
    }

    /// Number of stored records, regardless of status.
    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes staged for an [`InMemoryOutboxStore`].
///
/// Dropping the transaction without committing discards the writes.
#[derive(Debug, Default)]
pub struct InMemoryTransaction {
    staged: Vec<OutboxRecord>,
}

impl InMemoryTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written but not yet committed.
    pub fn staged(&self) -> &[OutboxRecord] {
        &self.staged
    }
}

impl OutboxBackend for InMemoryOutboxStore {
    type Error = InMemoryOutboxError;

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl InsertRecords for InMemoryOutboxStore {
    type Transaction<'a> = InMemoryTransaction;

    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), InMemoryOutboxError> {
        tx.staged.extend(records);
        Ok(())
    }
}

#[async_trait]
impl BeginTransaction for InMemoryOutboxStore {
    async fn begin(&self) -> Result<InMemoryTransaction, InMemoryOutboxError> {
        Ok(InMemoryTransaction::new())
    }

    /// Apply the staged writes. A duplicate id aborts the whole commit.
    async fn commit(&self, tx: InMemoryTransaction) -> Result<(), InMemoryOutboxError> {
        let mut table = self.table.lock().await;

        let mut seen = std::collections::HashSet::new();
        for record in &tx.staged {
            if table.rows.contains_key(&record.id) || !seen.insert(record.id) {
                return Err(InMemoryOutboxError::duplicate(record.id));
            }
        }

        for record in tx.staged {
            let seq = table.next_seq;
            table.next_seq += 1;
            table.rows.insert(record.id, Row { seq, record });
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimRecords for InMemoryOutboxStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<OutboxRecord>, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;

        for row in table.rows.values_mut() {
            if row.record.is_exhausted(max_retries) {
                row.record.status = OutboxStatus::Failed;
                row.record.updated_at = now;
            }
        }

        let ids: Vec<Uuid> = table
            .ordered(|r| r.is_claimable(max_retries, now))
            .into_iter()
            .take(limit)
            .map(|row| row.record.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = table.rows.get_mut(&id) {
                row.record.status = OutboxStatus::Processing;
                row.record.claimed_at = Some(now);
                row.record.updated_at = now;
                claimed.push(row.record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;
        match table.rows.get_mut(&id) {
            Some(row) if row.record.status == OutboxStatus::Pending => {
                row.record.status = OutboxStatus::Processing;
                row.record.claimed_at = Some(now);
                row.record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_claims(
        &self,
        ids: &[Uuid],
        claimed_at: DateTime<Utc>,
    ) -> Result<ClaimRenewal, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;

        let mut held = Vec::with_capacity(ids.len());
        for id in ids {
            match table.rows.get_mut(id) {
                Some(row)
                    if row.record.status == OutboxStatus::Processing
                        && row.record.claimed_at == Some(claimed_at) =>
                {
                    row.record.claimed_at = Some(now);
                    row.record.updated_at = now;
                    held.push(*id);
                }
                _ => {}
            }
        }
        Ok(ClaimRenewal {
            claimed_at: now,
            held,
        })
    }

    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<u64, InMemoryOutboxError> {
        let now = self.now();
        let Some(cutoff) = chrono::Duration::from_std(claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(0);
        };
        let mut table = self.table.lock().await;

        let expired: Vec<Uuid> = table
            .ordered(|r| {
                r.status == OutboxStatus::Processing
                    && r.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            })
            .into_iter()
            .map(|row| row.record.id)
            .collect();

        let reason = format!("claim expired after {}s", claim_timeout.as_secs());
        let mut reclaimed = 0;
        for id in expired {
            if table.fail(id, reason.clone(), policy, now) != FailureOutcome::Ignored {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

#[async_trait]
impl SettleRecords for InMemoryOutboxStore {
    async fn mark_as_completed(&self, id: Uuid) -> Result<bool, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;
        match table.rows.get_mut(&id) {
            Some(row) if !row.record.status.is_terminal() => {
                row.record.status = OutboxStatus::Completed;
                row.record.processed_at = Some(now);
                row.record.claimed_at = None;
                row.record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_as_failed(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;
        Ok(table.fail(id, error.to_owned(), policy, now))
    }
}

#[async_trait]
impl InspectRecords for InMemoryOutboxStore {
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, InMemoryOutboxError> {
        let table = self.table.lock().await;
        Ok(table.rows.get(&id).map(|row| row.record.clone()))
    }

    async fn stats(&self) -> Result<OutboxStats, InMemoryOutboxError> {
        let table = self.table.lock().await;
        let mut stats = OutboxStats::default();
        for row in table.rows.values() {
            stats.add(row.record.status, 1);
        }
        Ok(stats)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, InMemoryOutboxError> {
        let table = self.table.lock().await;
        Ok(table
            .ordered(|r| r.status == OutboxStatus::Failed)
            .into_iter()
            .take(limit)
            .map(|row| row.record.clone())
            .collect())
    }
}

#[async_trait]
impl MaintainRecords for InMemoryOutboxStore {
    async fn cleanup_completed(
        &self,
        older_than: chrono::Duration,
    ) -> Result<u64, InMemoryOutboxError> {
        let Some(cutoff) = self.now().checked_sub_signed(older_than) else {
            return Ok(0);
        };
        let mut table = self.table.lock().await;
        let before = table.rows.len();
        table.rows.retain(|_, row| {
            !(row.record.status == OutboxStatus::Completed
                && row.record.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - table.rows.len()) as u64)
    }

    async fn replay(&self, id: Uuid) -> Result<bool, InMemoryOutboxError> {
        let now = self.now();
        let mut table = self.table.lock().await;
        match table.rows.get_mut(&id) {
            Some(row) if row.record.status == OutboxStatus::Failed => {
                let record = &mut row.record;
                record.status = OutboxStatus::Pending;
                record.retry_count = 0;
                record.last_error = None;
                record.next_attempt_at = now;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Error type for `InMemoryOutboxStore` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn duplicate(id: Uuid) -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::DuplicateId(id),
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::DuplicateId(id) => {
                write!(f, "Record {id} already exists in in-memory outbox")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    DuplicateId(Uuid),
}
