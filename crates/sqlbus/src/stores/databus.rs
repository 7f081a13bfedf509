//! Data bus: large binary attachments referenced from messages by id.
//!
//! Payloads can be far bigger than what is sensible to materialize per
//! round-trip, so reads are streamed out of the `LONGBLOB` in
//! `SUBSTRING` chunks over a single transaction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use sqlx::Row;

use crate::connection::ConnectionProvider;
use crate::error::{is_duplicate_key, BusError};
use crate::table::TableName;

/// Bytes fetched per `SUBSTRING` round-trip.
const READ_CHUNK_BYTES: usize = 256 * 1024;

/// Well-known metadata keys added by [`MySqlDataBusStore::meta`].
pub const METADATA_LENGTH: &str = "sqlbus-data-length";
pub const METADATA_SAVE_TIME: &str = "sqlbus-data-save-time";
pub const METADATA_READ_TIME: &str = "sqlbus-data-read-time";

pub struct MySqlDataBusStore {
    provider: Arc<ConnectionProvider>,
    table: TableName,
}

impl MySqlDataBusStore {
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
             \x20 `id` VARCHAR(200) NOT NULL,\n\
             \x20 `meta` BLOB NOT NULL,\n\
             \x20 `data` LONGBLOB NOT NULL,\n\
             \x20 `creation_time` DATETIME(6) NOT NULL,\n\
             \x20 `last_read_time` DATETIME(6) NULL,\n\
             \x20 PRIMARY KEY (`id`)\n\
             )",
            self.table.qualified()
        );
        conn.execute_script(&ddl).await?;
        conn.complete().await
    }

    /// Store an attachment. A duplicate id is a [`BusError::Conflict`].
    pub async fn save(
        &self,
        id: &str,
        meta: &HashMap<String, String>,
        data: &[u8],
    ) -> Result<(), BusError> {
        let meta_bytes = serde_json::to_vec(meta).map_err(|e| BusError::MalformedMessage {
            reason: format!("failed to serialize attachment metadata: {e}"),
            source: Some(Box::new(e)),
        })?;
        let sql = format!(
            "INSERT INTO {} (`id`, `meta`, `data`, `creation_time`, `last_read_time`) \
             VALUES (?, ?, ?, NOW(6), NULL)",
            self.table.qualified()
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(meta_bytes)
            .bind(data)
            .execute(self.provider.pool())
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(BusError::Conflict {
                reason: format!("attachment '{id}' already exists"),
            }),
            Err(e) => Err(BusError::db(format!("failed to save attachment '{id}'"), e)),
        }
    }

    /// Read an attachment, stamping `last_read_time` first. The payload is
    /// streamed out in [`READ_CHUNK_BYTES`] chunks within one transaction.
    pub async fn read(&self, id: &str) -> Result<Vec<u8>, BusError> {
        let mut conn = self.provider.open().await?;

        let touch_sql = format!(
            "UPDATE {} SET `last_read_time` = NOW(6) WHERE `id` = ?",
            self.table.qualified()
        );
        let affected = sqlx::query(&touch_sql)
            .bind(id)
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to touch attachment '{id}'"), e))?
            .rows_affected();
        if affected == 0 {
            return Err(BusError::Persistence {
                reason: format!("attachment '{id}' does not exist"),
                source: None,
            });
        }

        let length_sql = format!(
            "SELECT LENGTH(`data`) AS `length` FROM {} WHERE `id` = ?",
            self.table.qualified()
        );
        let length: i64 = sqlx::query(&length_sql)
            .bind(id)
            .fetch_one(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to size attachment '{id}'"), e))?
            .try_get("length")
            .map_err(|e| BusError::db("failed to read 'length' column", e))?;

        let chunk_sql = format!(
            "SELECT SUBSTRING(`data`, ?, {READ_CHUNK_BYTES}) AS `chunk` FROM {} WHERE `id` = ?",
            self.table.qualified()
        );
        let mut data = Vec::with_capacity(usize::try_from(length).unwrap_or(0));
        // SUBSTRING positions are 1-based.
        let mut position: i64 = 1;
        while position <= length {
            let chunk: Vec<u8> = sqlx::query(&chunk_sql)
                .bind(position)
                .bind(id)
                .fetch_one(conn.executor()?)
                .await
                .map_err(|e| BusError::db(format!("failed to read attachment '{id}'"), e))?
                .try_get("chunk")
                .map_err(|e| BusError::db("failed to read 'chunk' column", e))?;
            if chunk.is_empty() {
                break;
            }
            position += chunk.len() as i64;
            data.extend_from_slice(&chunk);
        }

        conn.complete().await?;
        Ok(data)
    }

    /// The attachment's stored metadata plus the [`METADATA_LENGTH`],
    /// [`METADATA_SAVE_TIME`] and [`METADATA_READ_TIME`] entries.
    pub async fn meta(&self, id: &str) -> Result<HashMap<String, String>, BusError> {
        let sql = format!(
            "SELECT `meta`, LENGTH(`data`) AS `length`, `creation_time`, `last_read_time` \
             FROM {} WHERE `id` = ?",
            self.table.qualified()
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.provider.pool())
            .await
            .map_err(|e| BusError::db(format!("failed to read attachment '{id}' metadata"), e))?
            .ok_or_else(|| BusError::Persistence {
                reason: format!("attachment '{id}' does not exist"),
                source: None,
            })?;

        let meta_bytes: Vec<u8> = row
            .try_get("meta")
            .map_err(|e| BusError::db("failed to read 'meta' column", e))?;
        let length: i64 = row
            .try_get("length")
            .map_err(|e| BusError::db("failed to read 'length' column", e))?;
        let creation_time: NaiveDateTime = row
            .try_get("creation_time")
            .map_err(|e| BusError::db("failed to read 'creation_time' column", e))?;
        let last_read_time: Option<NaiveDateTime> = row
            .try_get("last_read_time")
            .map_err(|e| BusError::db("failed to read 'last_read_time' column", e))?;

        let mut meta: HashMap<String, String> =
            serde_json::from_slice(&meta_bytes).map_err(|e| BusError::Persistence {
                reason: format!("attachment '{id}' has unreadable metadata"),
                source: Some(Box::new(e)),
            })?;
        meta.insert(METADATA_LENGTH.to_string(), length.to_string());
        meta.insert(
            METADATA_SAVE_TIME.to_string(),
            creation_time.and_utc().to_rfc3339(),
        );
        if let Some(read_time) = last_read_time {
            meta.insert(
                METADATA_READ_TIME.to_string(),
                read_time.and_utc().to_rfc3339(),
            );
        }
        Ok(meta)
    }
}
