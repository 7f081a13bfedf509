//! Timeout store: deferred messages parked until their due time.
//!
//! `due_timeouts()` opens a transaction, locks the due rows with
//! `FOR UPDATE` and hands back a batch object. Consuming the batch and
//! calling `complete()` deletes the rows and commits; dropping the batch
//! rolls the transaction back and the timeouts surface again on the next
//! poll.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::connection::{BusConnection, ConnectionProvider};
use crate::error::BusError;
use crate::headers;
use crate::table::{self, TableName};

/// A timeout whose due time has passed.
#[derive(Debug, Clone)]
pub struct DueTimeout {
    pub id: i64,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct MySqlTimeoutStore {
    provider: Arc<ConnectionProvider>,
    table: TableName,
}

impl MySqlTimeoutStore {
    pub async fn new(
        provider: Arc<ConnectionProvider>,
        table: TableName,
        ensure_tables_created: bool,
    ) -> Result<Self, BusError> {
        let store = Self { provider, table };
        if ensure_tables_created {
            store.ensure_table_is_created().await?;
        }
        Ok(store)
    }

    async fn ensure_table_is_created(&self) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20 `id` BIGINT NOT NULL AUTO_INCREMENT,\n\
             \x20 `due_time` DATETIME(6) NOT NULL,\n\
             \x20 `headers` BLOB NOT NULL,\n\
             \x20 `body` LONGBLOB NOT NULL,\n\
             \x20 PRIMARY KEY (`id`)\n\
             )",
            self.table.qualified()
        );
        conn.execute_script(&ddl).await?;
        conn.execute_script(&table::create_index_if_not_exists(
            &self.table,
            "idx_due_time",
            "`due_time`",
        ))
        .await?;
        conn.complete().await
    }

    /// Park a message until `due_time`.
    pub async fn defer(
        &self,
        due_time: DateTime<Utc>,
        message_headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), BusError> {
        let header_bytes = headers::serialize_headers(message_headers)?;
        let sql = format!(
            "INSERT INTO {} (`due_time`, `headers`, `body`) VALUES (?, ?, ?)",
            self.table.qualified()
        );
        sqlx::query(&sql)
            .bind(due_time.naive_utc())
            .bind(header_bytes)
            .bind(body)
            .execute(self.provider.pool())
            .await
            .map_err(|e| BusError::db("failed to defer timeout", e))?;
        Ok(())
    }

    /// Lock and return every timeout that is due. The rows stay locked (and
    /// invisible to competing pollers) until the batch completes or is
    /// dropped.
    pub async fn due_timeouts(&self) -> Result<DueTimeoutBatch, BusError> {
        let mut conn = self.provider.open().await?;
        let sql = format!(
            "SELECT `id`, `headers`, `body` FROM {} \
             WHERE `due_time` <= NOW(6) ORDER BY `due_time` ASC FOR UPDATE",
            self.table.qualified()
        );
        let rows = sqlx::query(&sql)
            .fetch_all(conn.executor()?)
            .await
            .map_err(|e| BusError::db("failed to select due timeouts", e))?;

        let mut due = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row
                .try_get("id")
                .map_err(|e| BusError::db("failed to read 'id' column", e))?;
            let header_bytes: Vec<u8> = row
                .try_get("headers")
                .map_err(|e| BusError::db("failed to read 'headers' column", e))?;
            let body: Vec<u8> = row
                .try_get("body")
                .map_err(|e| BusError::db("failed to read 'body' column", e))?;
            due.push(DueTimeout {
                id,
                headers: headers::deserialize_headers(&header_bytes)?,
                body,
            });
        }

        Ok(DueTimeoutBatch {
            conn,
            table: self.table.clone(),
            due,
        })
    }
}

/// A locked batch of due timeouts. See [`MySqlTimeoutStore::due_timeouts`].
pub struct DueTimeoutBatch {
    conn: BusConnection,
    table: TableName,
    pub due: Vec<DueTimeout>,
}

impl DueTimeoutBatch {
    /// Delete the consumed timeouts and commit.
    pub async fn complete(mut self) -> Result<(), BusError> {
        if !self.due.is_empty() {
            let placeholders = std::iter::repeat("?")
                .take(self.due.len())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "DELETE FROM {} WHERE `id` IN ({placeholders})",
                self.table.qualified()
            );
            let mut query = sqlx::query(&sql);
            for timeout in &self.due {
                query = query.bind(timeout.id);
            }
            query
                .execute(self.conn.executor()?)
                .await
                .map_err(|e| BusError::db("failed to delete completed timeouts", e))?;
        }
        self.conn.complete().await
    }
}
