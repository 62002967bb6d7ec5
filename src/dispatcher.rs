//! Dispatch loop delivering outbox records through a transport.
//!
//! Each batch, per logical database:
//!
//! - returns stuck claims to the retry cycle (when a claim timeout is set)
//! - claims up to `batch_size` eligible records, oldest first
//! - before each publish, renews the claims on the rest of the batch and
//!   skips records another worker has taken over
//! - publishes each one through the [`Transport`], bounded by a timeout
//! - settles it as completed, requeued or dead-lettered
//!
//! Delivery is at-least-once: a record whose outcome could not be persisted
//! stays `PROCESSING` until the reaper hands it out again.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use uuid::Uuid;

use crate::{
    EventEnvelope, FailureOutcome, LogicalDatabase, Outbox, OutboxError, OutboxRecord,
    outbox::{ClaimRecords, SettleRecords},
    poller::PollerBuilder,
    transport::{Transport, TransportError},
};

/// Tuning knobs of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum records claimed per database and batch.
    pub batch_size: usize,
    /// Pause between batches of [`Dispatcher::run`].
    pub poll_interval: Duration,
    /// Upper bound on a single publish call.
    pub publish_timeout: Duration,
    /// Claims older than this are treated as failed attempts. `None` disables the reaper.
    ///
    /// Must exceed `publish_timeout`: claims are renewed between publishes, so
    /// a live claim is never older than one publish.
    pub claim_timeout: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(10),
            claim_timeout: Some(Duration::from_secs(5 * 60)),
        }
    }
}

/// What one batch did to one database's outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub database: LogicalDatabase,
    pub reclaimed: u64,
    pub claimed: usize,
    pub completed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Outcomes the store refused because the record had already moved on.
    pub ignored: usize,
    /// Records skipped unpublished because their claim could not be renewed.
    pub lost: usize,
}

impl DispatchReport {
    fn new(database: LogicalDatabase) -> Self {
        Self {
            database,
            reclaimed: 0,
            claimed: 0,
            completed: 0,
            requeued: 0,
            dead_lettered: 0,
            ignored: 0,
            lost: 0,
        }
    }

    /// Nothing was reclaimed or claimed.
    pub fn is_idle(&self) -> bool {
        self.reclaimed == 0 && self.claimed == 0
    }
}

/// Outbox dispatcher.
///
/// Generic parameters:
/// - `S`: store backing each registered database
/// - `T`: transport service accepting [`EventEnvelope`]s
/// - `HK`: hook implementation for lifecycle events
pub struct Dispatcher<S, T, HK = DefaultDispatchHook> {
    outbox: Outbox<S>,
    transport: Transport<T>,
    hook: Arc<HK>,
    settings: DispatchSettings,
}

impl<S, T> Dispatcher<S, T, DefaultDispatchHook> {
    /// Create a dispatcher with default settings and the default hook.
    pub fn new(outbox: Outbox<S>, transport: Transport<T>) -> Self {
        Self {
            outbox,
            transport,
            hook: Arc::new(DefaultDispatchHook),
            settings: DispatchSettings::default(),
        }
    }
}

impl<S, T, HK> Dispatcher<S, T, HK> {
    /// Replace the hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: DispatchHook>(self, hook: HK2) -> Dispatcher<S, T, HK2> {
        Dispatcher {
            outbox: self.outbox,
            transport: self.transport,
            hook: Arc::new(hook),
            settings: self.settings,
        }
    }

    pub fn with_settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn outbox(&self) -> &Outbox<S> {
        &self.outbox
    }
}

impl<S, T, HK> Dispatcher<S, T, HK>
where
    S: ClaimRecords + SettleRecords + 'static,
    T: Service<EventEnvelope> + Clone + Send + Sync + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
    HK: DispatchHook + 'static,
{
    /// Run one batch against `database`.
    ///
    /// Fails only if reclaiming or claiming fails. Per-record publish and
    /// settle failures are counted in the report and passed to the hook.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_batch(
        &self,
        database: LogicalDatabase,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::new(database);

        if let Some(claim_timeout) = self.settings.claim_timeout {
            report.reclaimed = self.outbox.reclaim_expired(database, claim_timeout).await?;
            if report.reclaimed > 0 {
                self.hook.on_reclaimed(database, report.reclaimed);
            }
        }

        let records = self
            .outbox
            .claim_pending(database, self.settings.batch_size)
            .await?;
        report.claimed = records.len();
        if records.is_empty() {
            return Ok(report);
        }
        self.hook.on_claimed(database, &records);

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut claimed_at = records[0].claimed_at;
        let mut transport = self.transport.clone();
        for (position, record) in records.iter().enumerate() {
            if !self
                .renew(database, record, &ids[position..], &mut claimed_at)
                .await
            {
                report.lost += 1;
                continue;
            }
            match self.publish(&mut transport, record.envelope(database)).await {
                Ok(()) => {
                    self.hook.on_delivered(database, record);
                    match self.outbox.mark_as_completed(database, record.id).await {
                        Ok(true) => report.completed += 1,
                        Ok(false) => report.ignored += 1,
                        Err(err) => self.hook.on_settle_error(database, record, &err),
                    }
                }
                Err(err) => {
                    self.hook.on_publish_error(database, record, &err);
                    match self
                        .outbox
                        .mark_as_failed(database, record.id, &err.message())
                        .await
                    {
                        Ok(FailureOutcome::Requeued {
                            retry_count,
                            next_attempt_at,
                        }) => {
                            report.requeued += 1;
                            self.hook
                                .on_requeued(database, record, retry_count, next_attempt_at);
                        }
                        Ok(FailureOutcome::DeadLettered { retry_count }) => {
                            report.dead_lettered += 1;
                            self.hook.on_dead_lettered(database, record, retry_count);
                        }
                        Ok(FailureOutcome::Ignored) => report.ignored += 1,
                        Err(err) => self.hook.on_settle_error(database, record, &err),
                    }
                }
            }
        }

        Ok(report)
    }

    /// Run one batch against every registered database.
    ///
    /// A database whose batch fails is reported through the hook and left
    /// out of the result; the others still run.
    pub async fn dispatch_all(&self) -> Vec<DispatchReport> {
        let databases: Vec<LogicalDatabase> = self.outbox.databases().collect();
        let mut reports = Vec::with_capacity(databases.len());
        for database in databases {
            match self.dispatch_batch(database).await {
                Ok(report) => reports.push(report),
                Err(err) => self.hook.on_database_error(database, &err),
            }
        }
        reports
    }

    /// Dispatch every `poll_interval` until `cancel` fires.
    ///
    /// The batch in flight at cancellation is finished before returning.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DispatchError> {
        self.hook.on_startup();

        let this = Arc::new(self);
        let mut poller = PollerBuilder::new(this.settings.poll_interval).start(cancel, {
            let this = Arc::clone(&this);
            move || {
                let this = Arc::clone(&this);
                async move { this.dispatch_all().await }
            }
        });

        while let Some(report) = poller.next().await {
            if !report.is_idle() {
                this.hook.on_batch_report(&report);
            }
        }

        let result = poller.join().await.map_err(DispatchError::poller);
        this.hook.on_shutdown();
        result
    }

    /// Renew the claims on `remaining` and report whether `record`, its first
    /// entry, is still ours to publish.
    async fn renew(
        &self,
        database: LogicalDatabase,
        record: &OutboxRecord,
        remaining: &[Uuid],
        claimed_at: &mut Option<DateTime<Utc>>,
    ) -> bool {
        let Some(held_since) = *claimed_at else {
            self.hook.on_claim_lost(database, record);
            return false;
        };
        match self
            .outbox
            .renew_claims(database, remaining, held_since)
            .await
        {
            Ok(renewal) => {
                if !renewal.held.is_empty() {
                    *claimed_at = Some(renewal.claimed_at);
                }
                let held = renewal.holds(record.id);
                if !held {
                    self.hook.on_claim_lost(database, record);
                }
                held
            }
            Err(err) => {
                self.hook.on_settle_error(database, record, &err);
                false
            }
        }
    }

    async fn publish(
        &self,
        transport: &mut Transport<T>,
        envelope: EventEnvelope,
    ) -> Result<(), TransportError> {
        let timeout = self.settings.publish_timeout;
        tokio::time::timeout(timeout, transport.send(envelope))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(timeout)))
    }
}

/// Error returned when a dispatch batch or the dispatch loop fails.
#[derive(Debug)]
pub struct DispatchError {
    context: tracing_error::SpanTrace,
    kind: DispatchErrorKind,
}

/// Classification of dispatch errors.
#[derive(Debug)]
pub enum DispatchErrorKind {
    /// Reclaiming or claiming records failed.
    Outbox(OutboxError),
    /// The background poll task panicked.
    Poller(tokio::task::JoinError),
}

impl DispatchError {
    fn poller(err: tokio::task::JoinError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: DispatchErrorKind::Poller(err),
        }
    }

    pub fn kind(&self) -> &DispatchErrorKind {
        &self.kind
    }
}

impl From<OutboxError> for DispatchError {
    fn from(err: OutboxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: DispatchErrorKind::Outbox(err),
        }
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DispatchErrorKind::Outbox(err) => writeln!(f, "Outbox error: {err}"),
            DispatchErrorKind::Poller(err) => writeln!(f, "Poller error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            DispatchErrorKind::Outbox(err) => Some(err),
            DispatchErrorKind::Poller(err) => Some(err),
        }
    }
}

/// Hook trait for observing dispatcher lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and alerting on dead letters.
pub trait DispatchHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_reclaimed(&self, database: LogicalDatabase, count: u64);
    fn on_claimed(&self, database: LogicalDatabase, records: &[OutboxRecord]);
    fn on_claim_lost(&self, database: LogicalDatabase, record: &OutboxRecord);
    fn on_delivered(&self, database: LogicalDatabase, record: &OutboxRecord);
    fn on_publish_error(
        &self,
        database: LogicalDatabase,
        record: &OutboxRecord,
        error: &TransportError,
    );
    fn on_requeued(
        &self,
        database: LogicalDatabase,
        record: &OutboxRecord,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    );
    fn on_dead_lettered(&self, database: LogicalDatabase, record: &OutboxRecord, retry_count: u32);
    fn on_settle_error(&self, database: LogicalDatabase, record: &OutboxRecord, error: &OutboxError);
    fn on_database_error(&self, database: LogicalDatabase, error: &DispatchError);
    fn on_batch_report(&self, report: &DispatchReport);
}

/// Default dispatch hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDispatchHook;

impl DispatchHook for DefaultDispatchHook {
    fn on_startup(&self) {
        tracing::info!("Dispatcher is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Dispatcher is shutting down");
    }

    fn on_reclaimed(&self, database: LogicalDatabase, count: u64) {
        tracing::warn!(%database, count, "Expired claims returned to the retry cycle");
    }

    fn on_claimed(&self, database: LogicalDatabase, records: &[OutboxRecord]) {
        tracing::debug!(%database, count = records.len(), "Records claimed");
    }

    fn on_claim_lost(&self, database: LogicalDatabase, record: &OutboxRecord) {
        tracing::warn!(%database, record_id = %record.id, "Claim expired before publishing, skipped");
    }

    fn on_delivered(&self, database: LogicalDatabase, record: &OutboxRecord) {
        tracing::info!(%database, record_id = %record.id, event_type = %record.event_type, "Record delivered");
    }

    fn on_publish_error(
        &self,
        database: LogicalDatabase,
        record: &OutboxRecord,
        error: &TransportError,
    ) {
        tracing::warn!(%database, record_id = %record.id, error = %error.message(), "Publish failed");
    }

    fn on_requeued(
        &self,
        database: LogicalDatabase,
        record: &OutboxRecord,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    ) {
        tracing::info!(%database, record_id = %record.id, retry_count, %next_attempt_at, "Record requeued");
    }

    fn on_dead_lettered(&self, database: LogicalDatabase, record: &OutboxRecord, retry_count: u32) {
        tracing::error!(%database, record_id = %record.id, retry_count, "Record dead-lettered");
    }

    fn on_settle_error(&self, database: LogicalDatabase, record: &OutboxRecord, error: &OutboxError) {
        tracing::error!(%database, record_id = %record.id, ?error, "Failed to persist publish outcome");
    }

    fn on_database_error(&self, database: LogicalDatabase, error: &DispatchError) {
        tracing::error!(%database, ?error, "Dispatch batch failed");
    }

    fn on_batch_report(&self, report: &DispatchReport) {
        tracing::info!(?report, "Dispatch batch finished");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        Backoff, ClaimRenewal, Clock, EventHeaders, ManualClock, OutboxEvent, OutboxStatus,
        RetryPolicy,
        outbox::{InspectRecords, OutboxBackend, inmemory::InMemoryOutboxStore},
        transport::{InMemory, SenderService},
    };

    type Sender = InMemory<EventHeaders, serde_json::Value>;

    fn event(aggregate_id: &str) -> OutboxEvent {
        OutboxEvent::new(
            "ACCOUNT",
            aggregate_id,
            "identity.account.created",
            json!({ "aggregate": aggregate_id }),
        )
    }

    fn dispatcher(
        clock: &ManualClock,
        sender: &Sender,
    ) -> Dispatcher<InMemoryOutboxStore, SenderService<Sender>> {
        let outbox = Outbox::new()
            .with_policy(RetryPolicy::new(3).with_backoff(Backoff::none()))
            .with_database(
                LogicalDatabase::Identity,
                InMemoryOutboxStore::with_clock(clock.clone()),
            )
            .with_database(
                LogicalDatabase::Auth,
                InMemoryOutboxStore::with_clock(clock.clone()),
            );
        Dispatcher::new(outbox, Transport::new(sender.clone()))
    }

    #[tokio::test]
    async fn delivered_records_are_completed() {
        let clock = ManualClock::default();
        let sender = Sender::default();
        let dispatcher = dispatcher(&clock, &sender);
        let db = LogicalDatabase::Identity;

        let records = dispatcher
            .outbox()
            .publish_batch_atomic(db, [event("a1"), event("a2")])
            .await
            .unwrap();

        let report = dispatcher.dispatch_batch(db).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.completed, 2);

        let published = sender.published().await;
        let ids: Vec<Uuid> = published.iter().map(|e| e.headers.id).collect();
        assert_eq!(ids, vec![records[0].id, records[1].id]);
        assert_eq!(published[0].headers.attempt, 1);
        assert_eq!(published[0].headers.database, db);
        assert_eq!(published[0].message, json!({ "aggregate": "a1" }));

        let stats = dispatcher.outbox().stats(db).await.unwrap();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn failing_bus_dead_letters_after_three_attempts() {
        let clock = ManualClock::default();
        let sender = Sender::default();
        sender.fail_next(3, "broker down").await;
        let dispatcher = dispatcher(&clock, &sender);
        let db = LogicalDatabase::Identity;

        let id = dispatcher
            .outbox()
            .publish_batch_atomic(db, [event("a1")])
            .await
            .unwrap()[0]
            .id;

        assert_eq!(dispatcher.dispatch_batch(db).await.unwrap().requeued, 1);
        assert_eq!(dispatcher.dispatch_batch(db).await.unwrap().requeued, 1);
        assert_eq!(dispatcher.dispatch_batch(db).await.unwrap().dead_lettered, 1);
        assert_eq!(dispatcher.dispatch_batch(db).await.unwrap().claimed, 0);

        let record = dispatcher.outbox().find(db, id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Failed);
        assert_eq!(record.retry_count, 3);
        assert_eq!(record.last_error.as_deref(), Some("broker down"));
        assert!(sender.published().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publish_times_out_and_is_requeued() {
        let clock = ManualClock::default();
        let sender = Sender::default();
        sender.set_latency(Some(Duration::from_secs(30))).await;
        let dispatcher = dispatcher(&clock, &sender).with_settings(DispatchSettings {
            publish_timeout: Duration::from_secs(10),
            ..DispatchSettings::default()
        });
        let db = LogicalDatabase::Identity;

        let id = dispatcher
            .outbox()
            .publish_batch_atomic(db, [event("a1")])
            .await
            .unwrap()[0]
            .id;

        let report = dispatcher.dispatch_batch(db).await.unwrap();
        assert_eq!(report.requeued, 1);

        let record = dispatcher.outbox().find(db, id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(
            record.last_error.as_deref(),
            Some("publish timed out after 10s")
        );
    }

    #[tokio::test]
    async fn stuck_claims_are_redelivered_as_a_new_attempt() {
        let clock = ManualClock::default();
        let sender = Sender::default();
        let dispatcher = dispatcher(&clock, &sender);
        let db = LogicalDatabase::Identity;

        dispatcher
            .outbox()
            .publish_batch_atomic(db, [event("a1")])
            .await
            .unwrap();
        // A worker claims the record and dies before settling it.
        dispatcher.outbox().claim_pending(db, 10).await.unwrap();

        assert!(dispatcher.dispatch_batch(db).await.unwrap().is_idle());

        clock.advance(chrono::Duration::minutes(6));
        let report = dispatcher.dispatch_batch(db).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(sender.published().await[0].headers.attempt, 2);
    }

    #[tokio::test]
    async fn dispatch_all_keeps_databases_apart() {
        let clock = ManualClock::default();
        let sender = Sender::default();
        let dispatcher = dispatcher(&clock, &sender);

        dispatcher
            .outbox()
            .publish_batch_atomic(LogicalDatabase::Auth, [event("u1")])
            .await
            .unwrap();

        let reports = dispatcher.dispatch_all().await;
        assert_eq!(reports.len(), 2);
        let identity = &reports[0];
        let auth = &reports[1];
        assert_eq!(identity.database, LogicalDatabase::Identity);
        assert!(identity.is_idle());
        assert_eq!(auth.completed, 1);

        let published = sender.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].headers.database, LogicalDatabase::Auth);
    }

    /// Wraps the in-memory store and fails chosen operations.
    #[derive(Clone)]
    struct Flaky {
        inner: InMemoryOutboxStore,
        fail_claims: bool,
        fail_settles: bool,
    }

    impl OutboxBackend for Flaky {
        type Error = tower::BoxError;

        fn now(&self) -> DateTime<Utc> {
            self.inner.now()
        }
    }

    #[async_trait::async_trait]
    impl ClaimRecords for Flaky {
        async fn claim_pending(
            &self,
            limit: usize,
            max_retries: u32,
        ) -> Result<Vec<OutboxRecord>, Self::Error> {
            if self.fail_claims {
                return Err("connection reset".into());
            }
            Ok(self.inner.claim_pending(limit, max_retries).await?)
        }

        async fn mark_as_processing(&self, id: Uuid) -> Result<bool, Self::Error> {
            Ok(self.inner.mark_as_processing(id).await?)
        }

        async fn renew_claims(
            &self,
            ids: &[Uuid],
            claimed_at: DateTime<Utc>,
        ) -> Result<ClaimRenewal, Self::Error> {
            Ok(self.inner.renew_claims(ids, claimed_at).await?)
        }

        async fn reclaim_expired(
            &self,
            claim_timeout: Duration,
            policy: &RetryPolicy,
        ) -> Result<u64, Self::Error> {
            Ok(self.inner.reclaim_expired(claim_timeout, policy).await?)
        }
    }

    #[async_trait::async_trait]
    impl SettleRecords for Flaky {
        async fn mark_as_completed(&self, id: Uuid) -> Result<bool, Self::Error> {
            if self.fail_settles {
                return Err("connection reset".into());
            }
            Ok(self.inner.mark_as_completed(id).await?)
        }

        async fn mark_as_failed(
            &self,
            id: Uuid,
            error: &str,
            policy: &RetryPolicy,
        ) -> Result<FailureOutcome, Self::Error> {
            if self.fail_settles {
                return Err("connection reset".into());
            }
            Ok(self.inner.mark_as_failed(id, error, policy).await?)
        }
    }

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<String>>,
    }

    impl Recording {
        fn push(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }
    }

    impl DispatchHook for Arc<Recording> {
        fn on_startup(&self) {
            self.push("startup");
        }
        fn on_shutdown(&self) {
            self.push("shutdown");
        }
        fn on_reclaimed(&self, _: LogicalDatabase, count: u64) {
            self.push(format!("reclaimed {count}"));
        }
        fn on_claimed(&self, _: LogicalDatabase, records: &[OutboxRecord]) {
            self.push(format!("claimed {}", records.len()));
        }
        fn on_claim_lost(&self, _: LogicalDatabase, _: &OutboxRecord) {
            self.push("claim lost");
        }
        fn on_delivered(&self, _: LogicalDatabase, _: &OutboxRecord) {
            self.push("delivered");
        }
        fn on_publish_error(&self, _: LogicalDatabase, _: &OutboxRecord, error: &TransportError) {
            self.push(format!("publish error: {}", error.message()));
        }
        fn on_requeued(&self, _: LogicalDatabase, _: &OutboxRecord, retry_count: u32, _: DateTime<Utc>) {
            self.push(format!("requeued {retry_count}"));
        }
        fn on_dead_lettered(&self, _: LogicalDatabase, _: &OutboxRecord, retry_count: u32) {
            self.push(format!("dead-lettered {retry_count}"));
        }
        fn on_settle_error(&self, _: LogicalDatabase, _: &OutboxRecord, _: &OutboxError) {
            self.push("settle error");
        }
        fn on_database_error(&self, database: LogicalDatabase, _: &DispatchError) {
            self.push(format!("database error: {database}"));
        }
        fn on_batch_report(&self, report: &DispatchReport) {
            self.push(format!("report {}", report.database));
        }
    }

    #[tokio::test]
    async fn settle_errors_leave_records_in_flight_without_stopping_the_batch() {
        let clock = ManualClock::default();
        let inner = InMemoryOutboxStore::with_clock(clock.clone());
        let store = Flaky {
            inner: inner.clone(),
            fail_claims: false,
            fail_settles: true,
        };
        let sender = Sender::default();
        let hook = Arc::new(Recording::default());
        let dispatcher = Dispatcher::new(
            Outbox::new().with_database(LogicalDatabase::Legal, store),
            Transport::new(sender.clone()),
        )
        .with_hook(Arc::clone(&hook));

        let seed = Outbox::new().with_database(LogicalDatabase::Legal, inner.clone());
        let records = seed
            .publish_batch_atomic(LogicalDatabase::Legal, [event("c1"), event("c2")])
            .await
            .unwrap();

        let report = dispatcher.dispatch_batch(LogicalDatabase::Legal).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.completed, 0);
        assert_eq!(sender.published().await.len(), 2);

        for record in &records {
            let stored = inner.find(record.id).await.unwrap().unwrap();
            assert_eq!(stored.status, OutboxStatus::Processing);
        }
        assert_eq!(
            *hook.events.lock().unwrap(),
            vec![
                "claimed 2",
                "delivered",
                "settle error",
                "delivered",
                "settle error"
            ]
        );
    }

    #[tokio::test]
    async fn one_broken_database_does_not_block_the_others() {
        let clock = ManualClock::default();
        let healthy = InMemoryOutboxStore::with_clock(clock.clone());
        let sender = Sender::default();
        let hook = Arc::new(Recording::default());
        let outbox = Outbox::new()
            .with_database(
                LogicalDatabase::Identity,
                Flaky {
                    inner: InMemoryOutboxStore::with_clock(clock.clone()),
                    fail_claims: true,
                    fail_settles: false,
                },
            )
            .with_database(
                LogicalDatabase::Auth,
                Flaky {
                    inner: healthy.clone(),
                    fail_claims: false,
                    fail_settles: false,
                },
            );
        let dispatcher =
            Dispatcher::new(outbox, Transport::new(sender.clone())).with_hook(Arc::clone(&hook));

        Outbox::new()
            .with_database(LogicalDatabase::Auth, healthy)
            .publish_batch_atomic(LogicalDatabase::Auth, [event("u1")])
            .await
            .unwrap();

        let reports = dispatcher.dispatch_all().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].database, LogicalDatabase::Auth);
        assert_eq!(reports[0].completed, 1);
        assert!(
            hook.events
                .lock()
                .unwrap()
                .contains(&"database error: identity".to_owned())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_dispatches_until_cancelled() {
        let sender = Sender::default();
        let hook = Arc::new(Recording::default());
        let store = InMemoryOutboxStore::new();
        let outbox = Outbox::new().with_database(LogicalDatabase::Identity, store.clone());
        outbox
            .publish_batch_atomic(LogicalDatabase::Identity, [event("a1")])
            .await
            .unwrap();

        let dispatcher = Dispatcher::new(outbox.clone(), Transport::new(sender.clone()))
            .with_hook(Arc::clone(&hook));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatcher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(3)).await;
        outbox
            .publish_batch_atomic(LogicalDatabase::Identity, [event("a2")])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(sender.published().await.len(), 2);
        let events = hook.events.lock().unwrap();
        assert_eq!(events.first().map(String::as_str), Some("startup"));
        assert_eq!(events.last().map(String::as_str), Some("shutdown"));
        assert_eq!(
            events.iter().filter(|e| e.as_str() == "report identity").count(),
            2
        );
    }

    /// Wall clock driven by tokio's (pausable) timer.
    #[derive(Debug)]
    struct TimerClock {
        origin: tokio::time::Instant,
        start: DateTime<Utc>,
    }

    impl TimerClock {
        fn new() -> Self {
            Self {
                origin: tokio::time::Instant::now(),
                start: Utc::now(),
            }
        }
    }

    impl Clock for TimerClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.origin.elapsed()).unwrap();
            self.start + elapsed
        }
    }

    fn aggregate_ids(published: &[EventEnvelope]) -> Vec<&str> {
        published
            .iter()
            .map(|envelope| envelope.headers.aggregate_id.as_str())
            .collect()
    }

    fn worker(
        store: &InMemoryOutboxStore,
        sender: &Sender,
        settings: DispatchSettings,
    ) -> Dispatcher<InMemoryOutboxStore, SenderService<Sender>> {
        Dispatcher::new(
            Outbox::new()
                .with_policy(RetryPolicy::new(3).with_backoff(Backoff::none()))
                .with_database(LogicalDatabase::Identity, store.clone()),
            Transport::new(sender.clone()),
        )
        .with_settings(settings)
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_dispatcher_never_reaps_claims_of_a_slow_batch() {
        let store = InMemoryOutboxStore::with_clock(TimerClock::new());
        let sender = Sender::default();
        sender.set_latency(Some(Duration::from_millis(700))).await;
        let settings = DispatchSettings {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(900),
            claim_timeout: Some(Duration::from_secs(1)),
        };
        let first = worker(&store, &sender, settings);
        let second = worker(&store, &sender, settings);

        let records = first
            .outbox()
            .publish_batch_atomic(
                LogicalDatabase::Identity,
                [event("a"), event("b"), event("c")],
            )
            .await
            .unwrap();

        let slow =
            tokio::spawn(async move { first.dispatch_batch(LogicalDatabase::Identity).await });
        // The first worker is publishing "c" by now; its batch was claimed 1.5s ago.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let report = second.dispatch_batch(LogicalDatabase::Identity).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.claimed, 0);

        let report = slow.await.unwrap().unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(report.lost, 0);

        assert_eq!(aggregate_ids(&sender.published().await), ["a", "b", "c"]);
        for record in records {
            let stored = store.find(record.id).await.unwrap().unwrap();
            assert_eq!(stored.status, OutboxStatus::Completed);
            assert_eq!(stored.retry_count, 0);
            assert_eq!(stored.last_error, None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn records_taken_over_by_another_worker_are_not_published_again() {
        let store = InMemoryOutboxStore::with_clock(TimerClock::new());
        let sender = Sender::default();
        sender.set_latency(Some(Duration::from_millis(1500))).await;
        // Claim timeout shorter than one publish: the second worker reaps the
        // first worker's whole batch while "a" is still in flight.
        let settings = DispatchSettings {
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(5),
            claim_timeout: Some(Duration::from_secs(1)),
        };
        let hook = Arc::new(Recording::default());
        let first = worker(&store, &sender, settings).with_hook(Arc::clone(&hook));
        let second = worker(&store, &sender, settings);

        first
            .outbox()
            .publish_batch_atomic(LogicalDatabase::Identity, [event("a"), event("b")])
            .await
            .unwrap();

        let slow =
            tokio::spawn(async move { first.dispatch_batch(LogicalDatabase::Identity).await });
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let report = second.dispatch_batch(LogicalDatabase::Identity).await.unwrap();
        assert_eq!(report.reclaimed, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.ignored, 1);

        let report = slow.await.unwrap().unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.lost, 1);
        assert!(hook.events.lock().unwrap().contains(&"claim lost".to_owned()));

        // "b" went out once, from the worker that held its claim.
        assert_eq!(aggregate_ids(&sender.published().await), ["a", "a", "b"]);
    }
}
