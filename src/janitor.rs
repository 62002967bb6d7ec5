//! Retention cleanup of delivered records.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::{LogicalDatabase, Outbox, outbox::MaintainRecords, poller::PollerBuilder};

/// Records deleted from one database by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub database: LogicalDatabase,
    pub deleted: u64,
}

/// Periodically deletes `COMPLETED` records older than the retention period
/// from every registered database. Other statuses are never touched.
pub struct Janitor<S> {
    outbox: Outbox<S>,
    retention_days: u32,
    interval: Duration,
}

impl<S> Janitor<S> {
    pub const DEFAULT_RETENTION_DAYS: u32 = 7;

    /// Seven days of retention, swept hourly.
    pub fn new(outbox: Outbox<S>) -> Self {
        Self {
            outbox,
            retention_days: Self::DEFAULT_RETENTION_DAYS,
            interval: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }
}

impl<S> Janitor<S>
where
    S: MaintainRecords + 'static,
{
    /// Clean every registered database once.
    ///
    /// A database that fails is logged and skipped; the next sweep retries it.
    #[tracing::instrument(skip(self), fields(retention_days = self.retention_days))]
    pub async fn sweep(&self) -> Vec<CleanupReport> {
        let databases: Vec<LogicalDatabase> = self.outbox.databases().collect();
        let mut reports = Vec::with_capacity(databases.len());
        for database in databases {
            match self
                .outbox
                .cleanup_completed(database, self.retention_days)
                .await
            {
                Ok(deleted) => reports.push(CleanupReport { database, deleted }),
                Err(error) => tracing::error!(%database, ?error, "Outbox cleanup failed"),
            }
        }
        reports
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            retention_days = self.retention_days,
            interval = ?self.interval,
            "Janitor is starting up"
        );

        let this = Arc::new(self);
        let mut poller = PollerBuilder::new(this.interval).start(cancel, {
            let this = Arc::clone(&this);
            move || {
                let this = Arc::clone(&this);
                async move { this.sweep().await }
            }
        });

        while let Some(report) = poller.next().await {
            if report.deleted > 0 {
                tracing::info!(database = %report.database, deleted = report.deleted, "Completed records purged");
            }
        }

        if let Err(error) = poller.join().await {
            tracing::error!(?error, "Janitor poll task failed");
        }
        tracing::info!("Janitor is shutting down");
    }
}
