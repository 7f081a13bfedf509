//! The MySQL transport: one table per queue, buffered sends flushed on
//! scope commit, and a lease-based receive path.
//!
//! Receiving is a two-round-trip transaction: an indexed
//! `SELECT ... FOR UPDATE` picks the single best deliverable row, an UPDATE
//! stamps the lease, and the commit makes the lease visible to the fleet.
//! Ack (scope commit) deletes the row; nack (scope abort) clears the lease
//! so the message is redelivered. Deadlocks (MySQL error 1213) on the
//! initial select terminate the attempt with `None` so the polling worker
//! backs off; deadlocks on the ack/nack statements are retried until they
//! go through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{LeasedByFactory, TransportConfig};
use crate::connection::{BusConnection, ConnectionProvider};
use crate::error::{is_deadlock, BusError};
use crate::headers::{self, TransportMessage};
use crate::metrics::BusMetrics;
use crate::scope::TransactionScope;
use crate::sweeper::QueueSweeper;
use crate::table::{self, TableName};

/// Scope item key under which the outbound buffer lives.
const OUTBOUND_BUFFER_KEY: &str = "sqlbus-outbound-buffer";

/// Column list of the receive-path index. Covers the deliverability
/// predicate and the ORDER BY in one traversal.
const RECEIVE_INDEX_COLUMNS: &str =
    "`priority` DESC, `visible` ASC, `id` ASC, `expiration` ASC, `leased_until` DESC";

struct OutgoingMessage {
    destination: TableName,
    message: TransportMessage,
}

type OutboundBuffer = Mutex<Vec<OutgoingMessage>>;

/// MySQL-backed queue transport.
pub struct MySqlTransport {
    provider: Arc<ConnectionProvider>,
    config: TransportConfig,
    leased_by: LeasedByFactory,
    receive_semaphore: Arc<Semaphore>,
    /// Active lease auto-renewers by row id.
    renewers: Arc<DashMap<i64, CancellationToken>>,
    metrics: Option<Arc<BusMetrics>>,
    shutdown: CancellationToken,
    sweeper_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MySqlTransport {
    pub async fn new(config: TransportConfig) -> Result<Self, BusError> {
        Self::with_metrics(config, None).await
    }

    pub async fn with_metrics(
        config: TransportConfig,
        metrics: Option<Arc<BusMetrics>>,
    ) -> Result<Self, BusError> {
        config.validate()?;
        let provider = Arc::new(
            ConnectionProvider::connect(
                &config.dsn,
                config.isolation_level,
                config.enlist_in_ambient_transaction,
            )
            .await?,
        );

        let leased_by = config.leased_by.clone().unwrap_or_else(default_leased_by);
        let transport = Self {
            receive_semaphore: Arc::new(Semaphore::new(config.max_concurrent_receives)),
            renewers: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            sweeper_handle: Mutex::new(None),
            provider,
            leased_by,
            metrics,
            config,
        };

        if let Some(queue) = transport.config.input_queue.clone() {
            if transport.config.ensure_tables_created {
                transport.create_queue(&queue).await?;
            }
            let sweeper = QueueSweeper::new(
                transport.provider.pool().clone(),
                queue,
                transport.config.expired_messages_cleanup_interval,
                transport.config.message_ack_timeout,
                transport.config.lease_tolerance,
                transport.shutdown.child_token(),
                transport.metrics.clone(),
            );
            let handle = tokio::spawn(async move { sweeper.run().await });
            *transport.sweeper_handle.lock() = Some(handle);
        }

        Ok(transport)
    }

    /// The queue this transport receives from, or `None` when send-only.
    pub fn address(&self) -> Option<&TableName> {
        self.config.input_queue.as_ref()
    }

    /// Create a queue table and its indexes. Idempotent; retried once to
    /// absorb the race where two processes create the same queue
    /// concurrently.
    pub async fn create_queue(&self, queue: &TableName) -> Result<(), BusError> {
        if let Err(first) = self.try_create_queue(queue).await {
            warn!(queue = %queue, error = %first, "queue creation failed, retrying once");
            self.try_create_queue(queue).await?;
        }
        Ok(())
    }

    async fn try_create_queue(&self, queue: &TableName) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        conn.execute_script(&queue_table_ddl(queue, self.config.use_ordering_key))
            .await?;
        if self.config.use_ordering_key {
            // Additive migration for tables created before the feature was on.
            conn.execute_script(&table::create_column_if_not_exists(
                queue,
                "ordering_key",
                "VARCHAR(200) NULL",
            ))
            .await?;
            conn.execute_script(&table::create_index_if_not_exists(
                queue,
                "idx_ordering_key",
                "`ordering_key`, `leased_until`",
            ))
            .await?;
        }
        conn.execute_script(&table::create_index_if_not_exists(
            queue,
            "idx_receive",
            RECEIVE_INDEX_COLUMNS,
        ))
        .await?;
        conn.execute_script(&table::create_index_if_not_exists(
            queue,
            "idx_expiration",
            "`expiration`",
        ))
        .await?;
        conn.complete().await
    }

    /// Buffer a message for `destination` on the scope. Nothing is written
    /// until the scope commits; the commit flushes every buffered message
    /// over a single transaction, in enqueue order.
    pub async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &TransactionScope,
    ) -> Result<(), BusError> {
        let destination = headers::resolve_destination(destination, &message.headers)?.to_string();
        let destination = TableName::parse(&destination)?;

        let (buffer, created) =
            scope.item_or_insert_with::<OutboundBuffer, _>(OUTBOUND_BUFFER_KEY, Default::default);
        if created {
            let provider = self.provider.clone();
            let metrics = self.metrics.clone();
            let use_ordering_key = self.config.use_ordering_key;
            let flush_buffer = buffer.clone();
            scope.on_committed(move || {
                flush_outbound(provider, flush_buffer, use_ordering_key, metrics)
            });
        }

        buffer.lock().push(OutgoingMessage {
            destination,
            message,
        });
        Ok(())
    }

    /// Lease the next deliverable message from the input queue. Returns
    /// `None` when the queue has nothing deliverable, or when the attempt
    /// lost a lock deadlock (the worker loop polls again). On success the
    /// scope carries the ack (delete) and nack (clear lease) actions.
    pub async fn receive(
        &self,
        scope: &TransactionScope,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, BusError> {
        let queue = self
            .config
            .input_queue
            .clone()
            .ok_or_else(|| BusError::InvalidConfig {
                reason: "transport has no input queue and cannot receive".to_string(),
            })?;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
            permit = self.receive_semaphore.clone().acquire_owned() => {
                permit.map_err(|_| BusError::ShuttingDown)?
            }
        };

        self.try_receive(&queue, scope, cancel).await
    }

    async fn try_receive(
        &self,
        queue: &TableName,
        scope: &TransactionScope,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, BusError> {
        let lease_tolerance_micros = duration_micros(self.config.lease_tolerance);
        let lease_micros = duration_micros(self.config.lease_interval);

        let mut conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
            conn = self.provider.open() => conn?,
        };

        let select_sql = receive_select_sql(queue, self.config.use_ordering_key);
        let row = {
            let executor = conn.executor()?;
            let fut = sqlx::query(&select_sql)
                .bind(lease_tolerance_micros)
                .fetch_optional(executor);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
                result = fut => match result {
                    Ok(row) => row,
                    Err(e) if is_deadlock(&e) => {
                        debug!(queue = %queue, "receive select lost a deadlock, backing off");
                        if let Some(m) = &self.metrics {
                            m.receive_deadlocks.inc();
                        }
                        return Ok(None);
                    }
                    Err(e) if cancel.is_cancelled() => {
                        return Err(BusError::Cancelled { source: Some(Box::new(e)) });
                    }
                    Err(e) => {
                        return Err(BusError::db(
                            format!("failed to select next message from {queue}"),
                            e,
                        ));
                    }
                }
            }
        };

        let Some(row) = row else {
            conn.complete().await?;
            if let Some(m) = &self.metrics {
                m.empty_receives.inc();
            }
            return Ok(None);
        };

        let id: i64 = row
            .try_get("id")
            .map_err(|e| BusError::db("failed to read 'id' column", e))?;
        let header_bytes: Vec<u8> = row
            .try_get("headers")
            .map_err(|e| BusError::db("failed to read 'headers' column", e))?;
        let body: Vec<u8> = row
            .try_get("body")
            .map_err(|e| BusError::db("failed to read 'body' column", e))?;

        let update_sql = format!(
            "UPDATE {} SET `leased_until` = DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
             `leased_at` = NOW(6), `leased_by` = ? WHERE `id` = ?",
            queue.qualified()
        );
        {
            let leased_by = (self.leased_by)();
            let executor = conn.executor()?;
            let fut = sqlx::query(&update_sql)
                .bind(lease_micros)
                .bind(leased_by)
                .bind(id)
                .execute(executor);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
                result = fut => match result {
                    Ok(_) => {}
                    Err(e) if is_deadlock(&e) => {
                        debug!(queue = %queue, id, "lease update lost a deadlock, backing off");
                        if let Some(m) = &self.metrics {
                            m.receive_deadlocks.inc();
                        }
                        return Ok(None);
                    }
                    Err(e) if cancel.is_cancelled() => {
                        return Err(BusError::Cancelled { source: Some(Box::new(e)) });
                    }
                    Err(e) => {
                        return Err(BusError::db(format!("failed to lease message {id}"), e));
                    }
                }
            }
        }

        // Make the lease visible to other receivers before handing the
        // message out.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled { source: None }),
            result = conn.complete() => result?,
        }

        self.register_scope_actions(scope, queue.clone(), id);
        if let Some(interval) = self.config.lease_auto_renew_interval {
            self.start_renewer(queue.clone(), id, interval);
        }
        if let Some(m) = &self.metrics {
            m.messages_received.inc();
        }

        let headers = headers::deserialize_headers(&header_bytes)?;
        debug!(queue = %queue, id, "leased message");
        Ok(Some(TransportMessage::new(headers, body)))
    }

    fn register_scope_actions(&self, scope: &TransactionScope, queue: TableName, id: i64) {
        let ack_pool = self.provider.pool().clone();
        let ack_queue = queue.clone();
        let ack_renewers = self.renewers.clone();
        scope.on_committed(move || async move {
            stop_renewer(&ack_renewers, id);
            let sql = format!("DELETE FROM {} WHERE `id` = ?", ack_queue.qualified());
            execute_until_not_deadlocked(&ack_pool, &sql, id, "delete acked message").await;
            Ok(())
        });

        let nack_pool = self.provider.pool().clone();
        let nack_renewers = self.renewers.clone();
        scope.on_aborted(move || async move {
            stop_renewer(&nack_renewers, id);
            let sql = format!(
                "UPDATE {} SET `leased_until` = NULL, `leased_by` = NULL, `leased_at` = NULL \
                 WHERE `id` = ?",
                queue.qualified()
            );
            execute_until_not_deadlocked(&nack_pool, &sql, id, "release nacked message").await;
            Ok(())
        });
    }

    fn start_renewer(&self, queue: TableName, id: i64, interval: Duration) {
        let token = self.shutdown.child_token();
        self.renewers.insert(id, token.clone());
        let pool = self.provider.pool().clone();
        let lease_micros = duration_micros(self.config.lease_interval);
        let sql = format!(
            "UPDATE {} SET `leased_until` = DATE_ADD(NOW(6), INTERVAL ? MICROSECOND) \
             WHERE `id` = ?",
            queue.qualified()
        );
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        match sqlx::query(&sql).bind(lease_micros).bind(id).execute(&pool).await {
                            Ok(result) if result.rows_affected() == 0 => {
                                debug!(id, "lease renewal found no row, stopping");
                                break;
                            }
                            Ok(_) => debug!(id, "renewed lease"),
                            Err(e) => warn!(id, error = %e, "lease renewal failed"),
                        }
                    }
                }
            }
        });
    }

    /// Stop background tasks and, when `auto_delete_queue` is set, drop the
    /// input queue table.
    pub async fn shutdown(&self) -> Result<(), BusError> {
        self.shutdown.cancel();
        let handle = self.sweeper_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if self.config.auto_delete_queue {
            if let Some(queue) = self.config.input_queue.clone() {
                if let Err(first) = self.drop_queue(&queue).await {
                    warn!(queue = %queue, error = %first, "queue drop failed, retrying once");
                    self.drop_queue(&queue).await?;
                }
            }
        }
        Ok(())
    }

    async fn drop_queue(&self, queue: &TableName) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let sql = format!("DROP TABLE IF EXISTS {}", queue.qualified());
        sqlx::query(&sql)
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to drop queue {queue}"), e))?;
        conn.complete().await
    }
}

fn default_leased_by() -> LeasedByFactory {
    Arc::new(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

fn stop_renewer(renewers: &DashMap<i64, CancellationToken>, id: i64) {
    if let Some((_, token)) = renewers.remove(&id) {
        token.cancel();
    }
}

/// Run a single ack/nack statement, retrying on deadlock until it goes
/// through. Other errors are logged and swallowed so scope completion
/// never masks the handler outcome.
async fn execute_until_not_deadlocked(pool: &MySqlPool, sql: &str, id: i64, what: &str) {
    loop {
        match sqlx::query(sql).bind(id).execute(pool).await {
            Ok(_) => return,
            Err(e) if is_deadlock(&e) => {
                debug!(id, what, "statement lost a deadlock, retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(id, what, error = %e, "statement failed, giving up");
                return;
            }
        }
    }
}

async fn flush_outbound(
    provider: Arc<ConnectionProvider>,
    buffer: Arc<OutboundBuffer>,
    use_ordering_key: bool,
    metrics: Option<Arc<BusMetrics>>,
) -> Result<(), BusError> {
    let outgoing: Vec<OutgoingMessage> = std::mem::take(&mut *buffer.lock());
    if outgoing.is_empty() {
        return Ok(());
    }

    let count = outgoing.len();
    let mut conn = provider.open().await?;
    for message in outgoing {
        insert_message(&mut conn, message, use_ordering_key).await?;
    }
    conn.complete().await?;

    if let Some(m) = &metrics {
        m.messages_sent.inc_by(count as u64);
    }
    debug!(count, "flushed outbound messages");
    Ok(())
}

async fn insert_message(
    conn: &mut BusConnection,
    outgoing: OutgoingMessage,
    use_ordering_key: bool,
) -> Result<(), BusError> {
    let OutgoingMessage {
        destination,
        message,
    } = outgoing;
    let TransportMessage { mut headers, body } = message;

    let priority = headers::priority(&headers)?;
    let deferred_until = headers::take_deferred_until(&mut headers)?;
    let ttl = headers::time_to_be_received(&headers)?;

    // A deferral in the past keeps its timestamp: visible-time ordering
    // among already-visible messages depends on it.
    let visible_micros: i64 = match deferred_until {
        Some(at) => (at - Utc::now()).num_microseconds().unwrap_or(i64::MAX),
        None => 0,
    };
    let expiration_micros = i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX);
    if expiration_micros <= visible_micros {
        return Err(BusError::MalformedMessage {
            reason: format!(
                "message to {destination} expires before it becomes visible \
                 (visible +{visible_micros}µs, expiration +{expiration_micros}µs)"
            ),
            source: None,
        });
    }

    let ordering_key = if use_ordering_key {
        headers::ordering_key(&headers).map(str::to_string)
    } else {
        None
    };
    let header_bytes = headers::serialize_headers(&headers)?;

    let sql = insert_sql(&destination, use_ordering_key);
    let mut query = sqlx::query(&sql)
        .bind(header_bytes)
        .bind(body)
        .bind(priority)
        .bind(visible_micros)
        .bind(expiration_micros);
    if use_ordering_key {
        query = query.bind(ordering_key);
    }
    query
        .execute(conn.executor()?)
        .await
        .map_err(|e| BusError::db(format!("failed to insert message into {destination}"), e))?;
    Ok(())
}

fn insert_sql(destination: &TableName, use_ordering_key: bool) -> String {
    if use_ordering_key {
        format!(
            "INSERT INTO {} (`headers`, `body`, `priority`, `visible`, `expiration`, \
             `ordering_key`, `leased_until`, `leased_by`, `leased_at`) \
             VALUES (?, ?, ?, DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
             DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), ?, NULL, NULL, NULL)",
            destination.qualified()
        )
    } else {
        format!(
            "INSERT INTO {} (`headers`, `body`, `priority`, `visible`, `expiration`, \
             `leased_until`, `leased_by`, `leased_at`) \
             VALUES (?, ?, ?, DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), \
             DATE_ADD(NOW(6), INTERVAL ? MICROSECOND), NULL, NULL, NULL)",
            destination.qualified()
        )
    }
}

fn receive_select_sql(queue: &TableName, use_ordering_key: bool) -> String {
    let q = queue.qualified();
    let ordering_predicate = if use_ordering_key {
        format!(
            " AND NOT EXISTS (SELECT 1 FROM {q} q2 WHERE q2.`ordering_key` = m.`ordering_key` \
             AND q2.`leased_until` > NOW(6) AND q2.`id` <> m.`id`)"
        )
    } else {
        String::new()
    };
    format!(
        "SELECT m.`id`, m.`headers`, m.`body` FROM {q} m \
         WHERE m.`visible` < NOW(6) AND m.`expiration` > NOW(6) \
         AND (m.`leased_until` IS NULL OR DATE_ADD(m.`leased_until`, INTERVAL ? MICROSECOND) < NOW(6))\
         {ordering_predicate} \
         ORDER BY m.`priority` DESC, m.`visible` ASC, m.`id` ASC LIMIT 1 FOR UPDATE"
    )
}

fn queue_table_ddl(queue: &TableName, use_ordering_key: bool) -> String {
    let ordering_column = if use_ordering_key {
        "  `ordering_key` VARCHAR(200) NULL,\n"
    } else {
        ""
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n\
         \x20 `id` BIGINT NOT NULL AUTO_INCREMENT,\n\
         \x20 `priority` INT NOT NULL DEFAULT 0,\n\
         \x20 `visible` DATETIME(6) NOT NULL,\n\
         \x20 `expiration` DATETIME(6) NOT NULL,\n\
         \x20 `headers` BLOB NOT NULL,\n\
         \x20 `body` LONGBLOB NOT NULL,\n\
         \x20 `leased_until` DATETIME(6) NULL,\n\
         \x20 `leased_by` VARCHAR(200) NULL,\n\
         \x20 `leased_at` DATETIME(6) NULL,\n\
         {ordering_column}\
         \x20 PRIMARY KEY (`id`)\n\
         )",
        queue.qualified()
    )
}

fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}
