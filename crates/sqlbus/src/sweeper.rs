//! Background expiration/reclaim sweeper for a queue table.
//!
//! Each cycle works in id-targeted batches of at most 100 rows: select the
//! ids, then delete (or clear) exactly those ids. The sweeper never runs a
//! locking scan over the deliverable range, so it cannot deadlock
//! concurrent receivers. Errors are logged and swallowed; the process
//! stays up and the next cycle tries again.

use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::metrics::BusMetrics;
use crate::table::TableName;

/// Hard cap on rows touched per batch.
const BATCH_LIMIT: usize = 100;

/// What one sweep pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Rows deleted because their `expiration` passed.
    pub expired_deleted: u64,
    /// Rows whose lapsed lease was cleared.
    pub leases_reclaimed: u64,
}

impl SweepStats {
    fn is_empty(&self) -> bool {
        self.expired_deleted == 0 && self.leases_reclaimed == 0
    }
}

/// Periodic sweeper over one queue table.
pub struct QueueSweeper {
    pool: MySqlPool,
    queue: TableName,
    interval: Duration,
    ack_timeout: Duration,
    lease_tolerance: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<BusMetrics>>,
}

impl QueueSweeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: MySqlPool,
        queue: TableName,
        interval: Duration,
        ack_timeout: Duration,
        lease_tolerance: Duration,
        cancel: CancellationToken,
        metrics: Option<Arc<BusMetrics>>,
    ) -> Self {
        Self {
            pool,
            queue,
            interval,
            ack_timeout,
            lease_tolerance,
            cancel,
            metrics,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep_once().await {
                        Ok(stats) if !stats.is_empty() => {
                            debug!(
                                queue = %self.queue,
                                expired = stats.expired_deleted,
                                reclaimed = stats.leases_reclaimed,
                                "sweep pass"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(queue = %self.queue, error = %e, "sweep pass failed"),
                    }
                }
            }
        }
    }

    /// One full sweep: delete expired rows, then reclaim lapsed leases,
    /// each repeated in batches until a pass affects nothing.
    pub async fn sweep_once(&self) -> Result<SweepStats, BusError> {
        let mut stats = SweepStats::default();

        loop {
            let ids = self.expired_ids().await?;
            if ids.is_empty() {
                break;
            }
            let sql = format!(
                "DELETE FROM {} WHERE `id` IN ({})",
                self.queue.qualified(),
                placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            let affected = query
                .execute(&self.pool)
                .await
                .map_err(|e| BusError::db("failed to delete expired messages", e))?
                .rows_affected();
            stats.expired_deleted += affected;
            if let Some(m) = &self.metrics {
                m.expired_messages_deleted.inc_by(affected);
            }
            if affected == 0 {
                break;
            }
        }

        loop {
            let ids = self.lapsed_lease_ids().await?;
            if ids.is_empty() {
                break;
            }
            let sql = format!(
                "UPDATE {} SET `leased_until` = NULL, `leased_by` = NULL, `leased_at` = NULL \
                 WHERE `id` IN ({})",
                self.queue.qualified(),
                placeholders(ids.len())
            );
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            let affected = query
                .execute(&self.pool)
                .await
                .map_err(|e| BusError::db("failed to reclaim lapsed leases", e))?
                .rows_affected();
            stats.leases_reclaimed += affected;
            if let Some(m) = &self.metrics {
                m.leases_reclaimed.inc_by(affected);
            }
            if affected == 0 {
                break;
            }
        }

        Ok(stats)
    }

    async fn expired_ids(&self) -> Result<Vec<i64>, BusError> {
        let sql = format!(
            "SELECT `id` FROM {} WHERE `expiration` < NOW(6) LIMIT {BATCH_LIMIT}",
            self.queue.qualified()
        );
        self.fetch_ids(&sql, "failed to select expired messages", &[])
            .await
    }

    /// Rows whose lease lapsed past the tolerance and were leased longer
    /// ago than the ack timeout. An active renewer keeps `leased_until`
    /// fresh, so its rows never match.
    async fn lapsed_lease_ids(&self) -> Result<Vec<i64>, BusError> {
        let sql = format!(
            "SELECT `id` FROM {} WHERE `leased_until` IS NOT NULL \
             AND DATE_ADD(`leased_until`, INTERVAL ? MICROSECOND) < NOW(6) \
             AND `leased_at` < DATE_SUB(NOW(6), INTERVAL ? MICROSECOND) \
             LIMIT {BATCH_LIMIT}",
            self.queue.qualified()
        );
        let tolerance = i64::try_from(self.lease_tolerance.as_micros()).unwrap_or(i64::MAX);
        let ack_timeout = i64::try_from(self.ack_timeout.as_micros()).unwrap_or(i64::MAX);
        self.fetch_ids(
            &sql,
            "failed to select lapsed leases",
            &[tolerance, ack_timeout],
        )
        .await
    }

    async fn fetch_ids(&self, sql: &str, context: &str, binds: &[i64]) -> Result<Vec<i64>, BusError> {
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = query.bind(bind);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BusError::db(context, e))?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| BusError::db("failed to read 'id' column", e))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lists() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn empty_stats_detection() {
        assert!(SweepStats::default().is_empty());
        assert!(!SweepStats {
            expired_deleted: 1,
            leases_reclaimed: 0
        }
        .is_empty());
    }
}
