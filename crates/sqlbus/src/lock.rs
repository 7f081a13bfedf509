//! Distributed exclusive-access lock over a single MySQL table.
//!
//! Acquisition is INSERT-or-fail: the primary key on `lock_key` makes the
//! insert race safe, and a duplicate-key rejection (1062) simply means
//! another holder got there first. The lock is advisory: holders release
//! explicitly on the normal path, and the TTL plus the background sweeper
//! only reclaim locks whose holder died.

use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::connection::ConnectionProvider;
use crate::error::{is_duplicate_key, BusError};
use crate::metrics::BusMetrics;
use crate::table::{self, TableName};

/// Hard cap on locks removed per sweep batch.
const SWEEP_BATCH_LIMIT: usize = 100;

/// Longest accepted lock key, matching the `VARCHAR(255)` key column.
pub const MAX_LOCK_KEY_CHARS: usize = 255;

pub struct ExclusiveAccessLock {
    provider: Arc<ConnectionProvider>,
    table: TableName,
    ttl: Duration,
    metrics: Option<Arc<BusMetrics>>,
    shutdown: CancellationToken,
    sweeper_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExclusiveAccessLock {
    pub async fn new(
        provider: Arc<ConnectionProvider>,
        config: LockConfig,
    ) -> Result<Self, BusError> {
        Self::with_metrics(provider, config, None).await
    }

    pub async fn with_metrics(
        provider: Arc<ConnectionProvider>,
        config: LockConfig,
        metrics: Option<Arc<BusMetrics>>,
    ) -> Result<Self, BusError> {
        config.validate()?;

        let lock = Self {
            provider,
            table: config.table.clone(),
            ttl: config.ttl,
            metrics,
            shutdown: CancellationToken::new(),
            sweeper_handle: parking_lot::Mutex::new(None),
        };
        lock.ensure_table_is_created().await?;

        let sweeper = LockSweeper {
            provider: lock.provider.clone(),
            table: lock.table.clone(),
            interval: config.sweep_interval,
            cancel: lock.shutdown.child_token(),
            metrics: lock.metrics.clone(),
        };
        let handle = tokio::spawn(async move { sweeper.run().await });
        *lock.sweeper_handle.lock() = Some(handle);

        Ok(lock)
    }

    async fn ensure_table_is_created(&self) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20 `lock_key` VARCHAR(255) NOT NULL,\n\
             \x20 `expiration` DATETIME NOT NULL,\n\
             \x20 PRIMARY KEY (`lock_key`)\n\
             )",
            self.table.qualified()
        );
        conn.execute_script(&ddl).await?;
        conn.execute_script(&table::create_index_if_not_exists(
            &self.table,
            "idx_expiration",
            "`expiration`",
        ))
        .await?;
        conn.complete().await
    }

    /// Try to take the lock. `false` means another holder has it. Each
    /// call is committed on its own.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> Result<bool, BusError> {
        validate_key(key)?;

        // Cheap pre-check: most contended acquisitions stop at the SELECT
        // without burning an insert attempt.
        if self.exists(key, cancel).await? {
            if let Some(m) = &self.metrics {
                m.locks_contended.inc();
            }
            return Ok(false);
        }

        let sql = format!(
            "INSERT INTO {} (`lock_key`, `expiration`) \
             VALUES (?, DATE_ADD(NOW(), INTERVAL ? SECOND))",
            self.table.qualified()
        );
        let ttl_seconds = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let fut = sqlx::query(&sql)
            .bind(key)
            .bind(ttl_seconds)
            .execute(self.provider.pool());
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
            result = fut => result,
        };

        match result {
            Ok(_) => {
                if let Some(m) = &self.metrics {
                    m.locks_acquired.inc();
                }
                debug!(key, "acquired lock");
                Ok(true)
            }
            Err(e) if is_duplicate_key(&e) => {
                if let Some(m) = &self.metrics {
                    m.locks_contended.inc();
                }
                debug!(key, "lost lock acquisition race");
                Ok(false)
            }
            Err(e) if cancel.is_cancelled() => Err(BusError::Cancelled {
                source: Some(Box::new(e)),
            }),
            Err(e) => Err(BusError::db(format!("failed to acquire lock '{key}'"), e)),
        }
    }

    /// Whether a lock row currently exists for `key`.
    pub async fn is_held(&self, key: &str) -> Result<bool, BusError> {
        validate_key(key)?;
        self.exists(key, &CancellationToken::new()).await
    }

    /// Release the lock. Returns whether a row was actually removed.
    pub async fn release(&self, key: &str) -> Result<bool, BusError> {
        validate_key(key)?;
        let sql = format!(
            "DELETE FROM {} WHERE `lock_key` = ?",
            self.table.qualified()
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .execute(self.provider.pool())
            .await
            .map_err(|e| BusError::db(format!("failed to release lock '{key}'"), e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn exists(&self, key: &str, cancel: &CancellationToken) -> Result<bool, BusError> {
        let sql = format!(
            "SELECT `lock_key` FROM {} WHERE `lock_key` = ?",
            self.table.qualified()
        );
        let fut = sqlx::query(&sql).bind(key).fetch_optional(self.provider.pool());
        let row = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
            result = fut => result.map_err(|e| {
                if cancel.is_cancelled() {
                    BusError::Cancelled { source: Some(Box::new(e)) }
                } else {
                    BusError::db(format!("failed to look up lock '{key}'"), e)
                }
            })?,
        };
        Ok(row.is_some())
    }

    /// Remove expired locks in key-targeted batches. Returns how many were
    /// removed. Exposed for tests; the background sweeper calls this on its
    /// own timer.
    pub async fn sweep_once(&self) -> Result<u64, BusError> {
        sweep_expired(&self.provider, &self.table, self.metrics.as_deref()).await
    }

    /// Stop the background sweeper.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn validate_key(key: &str) -> Result<(), BusError> {
    if key.is_empty() {
        return Err(BusError::MalformedMessage {
            reason: "lock key must not be empty".to_string(),
            source: None,
        });
    }
    let chars = key.chars().count();
    if chars > MAX_LOCK_KEY_CHARS {
        return Err(BusError::MalformedMessage {
            reason: format!("lock key is {chars} characters, max is {MAX_LOCK_KEY_CHARS}"),
            source: None,
        });
    }
    Ok(())
}

struct LockSweeper {
    provider: Arc<ConnectionProvider>,
    table: TableName,
    interval: Duration,
    cancel: CancellationToken,
    metrics: Option<Arc<BusMetrics>>,
}

impl LockSweeper {
    async fn run(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    match sweep_expired(&self.provider, &self.table, self.metrics.as_deref()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(table = %self.table, removed, "swept expired locks"),
                        Err(e) => warn!(table = %self.table, error = %e, "lock sweep failed"),
                    }
                }
            }
        }
    }
}

async fn sweep_expired(
    provider: &ConnectionProvider,
    table: &TableName,
    metrics: Option<&BusMetrics>,
) -> Result<u64, BusError> {
    let mut removed = 0;
    loop {
        let select_sql = format!(
            "SELECT `lock_key` FROM {} WHERE `expiration` < NOW() LIMIT {SWEEP_BATCH_LIMIT}",
            table.qualified()
        );
        let rows = sqlx::query(&select_sql)
            .fetch_all(provider.pool())
            .await
            .map_err(|e| BusError::db("failed to select expired locks", e))?;
        if rows.is_empty() {
            break;
        }

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row
                .try_get("lock_key")
                .map_err(|e| BusError::db("failed to read 'lock_key' column", e))?;
            keys.push(key);
        }

        let delete_sql = format!(
            "DELETE FROM {} WHERE `lock_key` IN ({})",
            table.qualified(),
            std::iter::repeat("?")
                .take(keys.len())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut query = sqlx::query(&delete_sql);
        for key in &keys {
            query = query.bind(key);
        }
        let affected = query
            .execute(provider.pool())
            .await
            .map_err(|e| BusError::db("failed to delete expired locks", e))?
            .rows_affected();
        removed += affected;
        if let Some(m) = metrics {
            m.locks_swept.inc_by(affected);
        }
        if affected == 0 {
            break;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_bounds() {
        validate_key("a").unwrap();
        validate_key(&"k".repeat(255)).unwrap();
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(256)).is_err());
    }

    #[test]
    fn multibyte_keys_count_characters_not_bytes() {
        // 255 three-byte characters is 765 bytes but still fits VARCHAR(255).
        validate_key(&"日".repeat(255)).unwrap();
        assert!(validate_key(&"日".repeat(256)).is_err());
    }
}
