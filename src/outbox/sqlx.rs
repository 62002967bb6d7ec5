use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ClaimRenewal, Clock, FailureOutcome, OutboxRecord, OutboxStats, OutboxStatus, RetryPolicy, SystemClock,
    outbox::{
        BeginTransaction, ClaimRecords, InsertRecords, InspectRecords, MaintainRecords,
        OutboxBackend, SettleRecords,
    },
    record::ParseStatusError,
};

const COLUMNS: &str = "id, aggregate_type, aggregate_id, event_type, payload, status, \
     retry_count, last_error, next_attempt_at, claimed_at, processed_at, created_at, updated_at";

/// Postgres outbox table driver.
///
/// One instance serves one logical database's table. Every state transition
/// is a single conditional statement or runs under `SELECT ... FOR UPDATE`,
/// so several dispatchers can share the table safely.
#[derive(Clone)]
pub struct SqlxOutboxStore {
    pool: PgPool,
    table: Arc<str>,
    clock: Arc<dyn Clock>,
}

impl SqlxOutboxStore {
    /// Creates a store over an existing table without touching the schema.
    pub fn new_uninitialized(pool: PgPool, table: &str) -> Result<Self, Error> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: Arc::from(table),
            clock: Arc::new(SystemClock),
        })
    }

    /// Creates a store and ensures its table and claim index exist.
    #[tracing::instrument(skip(pool))]
    pub async fn try_new(pool: PgPool, table: &str) -> Result<Self, Error> {
        let store = Self::new_uninitialized(pool, table)?;
        store.create_table().await?;
        Ok(store)
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    async fn create_table(&self) -> Result<(), Error> {
        let table = &self.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED')),
                retry_count INT NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
                last_error TEXT,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                claimed_at TIMESTAMPTZ,
                processed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_claim_idx \
             ON {table} (status, next_attempt_at, created_at)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Apply one failed attempt to an in-flight record inside `tx`.
    async fn fail_locked(
        &self,
        tx: &mut sqlx::PgTransaction<'_>,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, Error> {
        let table = &self.table;
        let row = sqlx::query(&format!(
            "SELECT status, retry_count FROM {table} WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailureOutcome::Ignored);
        };
        let status: OutboxStatus = row.try_get::<String, _>("status")?.parse()?;
        if status != OutboxStatus::Processing {
            return Ok(FailureOutcome::Ignored);
        }
        let retry_count = row.try_get::<i32, _>("retry_count")?.max(0) as u32;

        let outcome = policy.on_failure(retry_count, now);
        let (status, retry_count, next_attempt_at) = match outcome {
            FailureOutcome::Requeued {
                retry_count,
                next_attempt_at,
            } => (OutboxStatus::Pending, retry_count, Some(next_attempt_at)),
            FailureOutcome::DeadLettered { retry_count } => {
                (OutboxStatus::Failed, retry_count, None)
            }
            FailureOutcome::Ignored => return Ok(outcome),
        };

        sqlx::query(&format!(
            "UPDATE {table} SET status = $2, retry_count = $3, last_error = $4, \
             next_attempt_at = COALESCE($5, next_attempt_at), claimed_at = NULL, updated_at = $6 \
             WHERE id = $1"
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(i32::try_from(retry_count).unwrap_or(i32::MAX))
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(outcome)
    }
}

fn validate_table_name(table: &str) -> Result<(), Error> {
    let valid = !table.is_empty()
        && table.len() <= 63
        && table
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::new(SqlxDriverErrorKind::InvalidTable(table.to_owned())))
    }
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord, Error> {
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_at: row.try_get("claimed_at")?,
        processed_at: row.try_get("processed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl OutboxBackend for SqlxOutboxStore {
    type Error = Error;

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl InsertRecords for SqlxOutboxStore {
    type Transaction<'a> = sqlx::PgTransaction<'a>;

    #[tracing::instrument(skip_all, fields(table = %self.table, count = records.len()))]
    async fn insert_records(
        &self,
        records: Vec<OutboxRecord>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<(), Self::Error> {
        let table = &self.table;
        let sql = format!("INSERT INTO {table} ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)");
        for record in records {
            sqlx::query(&sql)
                .bind(record.id)
                .bind(record.aggregate_type)
                .bind(record.aggregate_id)
                .bind(record.event_type)
                .bind(record.payload)
                .bind(record.status.as_str())
                .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
                .bind(record.last_error)
                .bind(record.next_attempt_at)
                .bind(record.claimed_at)
                .bind(record.processed_at)
                .bind(record.created_at)
                .bind(record.updated_at)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BeginTransaction for SqlxOutboxStore {
    async fn begin(&self) -> Result<sqlx::PgTransaction<'static>, Error> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: sqlx::PgTransaction<'static>) -> Result<(), Error> {
        Ok(tx.commit().await?)
    }
}

#[async_trait]
impl ClaimRecords for SqlxOutboxStore {
    /// Claims with a single `UPDATE ... FROM (SELECT ... FOR UPDATE SKIP LOCKED)`,
    /// so concurrent dispatchers partition the eligible rows between them.
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn claim_pending(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<OutboxRecord>, Error> {
        let table = &self.table;
        let now = self.now();
        let max_retries = i32::try_from(max_retries).unwrap_or(i32::MAX);
        sqlx::query(&format!(
            "UPDATE {table} SET status = 'FAILED', updated_at = $1 \
             WHERE status = 'PENDING' AND retry_count >= $2"
        ))
        .bind(now)
        .bind(max_retries)
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "UPDATE {table} AS o
             SET status = 'PROCESSING', claimed_at = $1, updated_at = $1
             FROM (
                 SELECT id FROM {table}
                 WHERE status = 'PENDING' AND retry_count < $2 AND next_attempt_at <= $1
                 ORDER BY created_at, id
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             ) AS candidates
             WHERE o.id = candidates.id
             RETURNING o.id, o.aggregate_type, o.aggregate_id, o.event_type, o.payload, o.status,
                 o.retry_count, o.last_error, o.next_attempt_at, o.claimed_at, o.processed_at,
                 o.created_at, o.updated_at"
        ))
        .bind(now)
        .bind(max_retries)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn mark_as_processing(&self, id: Uuid) -> Result<bool, Error> {
        let table = &self.table;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = 'PROCESSING', claimed_at = $2, updated_at = $2 \
             WHERE id = $1 AND status = 'PENDING'"
        ))
        .bind(id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, ids), fields(table = %self.table, count = ids.len()))]
    async fn renew_claims(
        &self,
        ids: &[Uuid],
        claimed_at: DateTime<Utc>,
    ) -> Result<ClaimRenewal, Error> {
        let table = &self.table;
        let rows = sqlx::query(&format!(
            "UPDATE {table} SET claimed_at = $1, updated_at = $1 \
             WHERE id = ANY($2) AND status = 'PROCESSING' AND claimed_at = $3 \
             RETURNING id, claimed_at"
        ))
        .bind(self.now())
        .bind(ids)
        .bind(claimed_at)
        .fetch_all(&self.pool)
        .await?;

        // Postgres keeps microseconds, so the stored value is the next token.
        let mut renewal = ClaimRenewal {
            claimed_at,
            held: Vec::with_capacity(rows.len()),
        };
        for row in &rows {
            renewal.held.push(row.try_get("id")?);
            renewal.claimed_at = row.try_get("claimed_at")?;
        }
        Ok(renewal)
    }

    #[tracing::instrument(skip(self, policy), fields(table = %self.table))]
    async fn reclaim_expired(
        &self,
        claim_timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<u64, Error> {
        let table = &self.table;
        let now = self.now();
        let Some(cutoff) = chrono::Duration::from_std(claim_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        else {
            return Ok(0);
        };

        let mut tx = self.pool.begin().await?;
        let expired: Vec<Uuid> = sqlx::query_scalar(&format!(
            "SELECT id FROM {table} WHERE status = 'PROCESSING' AND claimed_at < $1 \
             ORDER BY created_at FOR UPDATE SKIP LOCKED"
        ))
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        let reason = format!("claim expired after {}s", claim_timeout.as_secs());
        let mut reclaimed = 0;
        for id in expired {
            let outcome = self.fail_locked(&mut tx, id, &reason, policy, now).await?;
            if outcome != FailureOutcome::Ignored {
                reclaimed += 1;
            }
        }
        tx.commit().await?;
        Ok(reclaimed)
    }
}

#[async_trait]
impl SettleRecords for SqlxOutboxStore {
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn mark_as_completed(&self, id: Uuid) -> Result<bool, Error> {
        let table = &self.table;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = 'COMPLETED', processed_at = $2, claimed_at = NULL, \
             updated_at = $2 WHERE id = $1 AND status IN ('PROCESSING', 'PENDING')"
        ))
        .bind(id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, policy), fields(table = %self.table))]
    async fn mark_as_failed(
        &self,
        id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome, Error> {
        let mut tx = self.pool.begin().await?;
        let outcome = self.fail_locked(&mut tx, id, error, policy, self.now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

#[async_trait]
impl InspectRecords for SqlxOutboxStore {
    async fn find(&self, id: Uuid) -> Result<Option<OutboxRecord>, Error> {
        let table = &self.table;
        sqlx::query(&format!("SELECT {COLUMNS} FROM {table} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn stats(&self) -> Result<OutboxStats, Error> {
        let table = &self.table;
        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS count FROM {table} GROUP BY status"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: OutboxStatus = row.try_get::<String, _>("status")?.parse()?;
            let count: i64 = row.try_get("count")?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<OutboxRecord>, Error> {
        let table = &self.table;
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {table} WHERE status = 'FAILED' \
             ORDER BY created_at, id LIMIT $1"
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl MaintainRecords for SqlxOutboxStore {
    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn cleanup_completed(&self, older_than: chrono::Duration) -> Result<u64, Error> {
        let table = &self.table;
        let Some(cutoff) = self.now().checked_sub_signed(older_than) else {
            return Ok(0);
        };
        let result = sqlx::query(&format!(
            "DELETE FROM {table} WHERE status = 'COMPLETED' AND processed_at < $1"
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn replay(&self, id: Uuid) -> Result<bool, Error> {
        let table = &self.table;
        let result = sqlx::query(&format!(
            "UPDATE {table} SET status = 'PENDING', retry_count = 0, last_error = NULL, \
             next_attempt_at = $2, updated_at = $2 WHERE id = $1 AND status = 'FAILED'"
        ))
        .bind(id)
        .bind(self.now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Sqlx outbox errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: SqlxDriverErrorKind,
}

impl Error {
    fn new(kind: SqlxDriverErrorKind) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &SqlxDriverErrorKind {
        &self.kind
    }
}

/// Kinds of SQLx outbox errors.
#[derive(Debug)]
pub enum SqlxDriverErrorKind {
    Database(sqlx::Error),
    /// A status column held a value outside the known set.
    Status(ParseStatusError),
    /// The table name is not a plain SQL identifier.
    InvalidTable(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
            SqlxDriverErrorKind::Status(err) => writeln!(f, "Corrupt record: {}", err),
            SqlxDriverErrorKind::InvalidTable(table) => {
                writeln!(f, "Invalid outbox table name `{}`", table)
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SqlxDriverErrorKind::Database(err) => Some(err),
            SqlxDriverErrorKind::Status(err) => Some(err),
            SqlxDriverErrorKind::InvalidTable(_) => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::new(SqlxDriverErrorKind::Database(err))
    }
}

impl From<ParseStatusError> for Error {
    fn from(err: ParseStatusError) -> Self {
        Self::new(SqlxDriverErrorKind::Status(err))
    }
}
