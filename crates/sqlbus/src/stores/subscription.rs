//! Topic → subscriber registry.
//!
//! The `(topic, address)` compound primary key makes registration
//! idempotent: a duplicate insert is swallowed. Column widths are read
//! from `INFORMATION_SCHEMA` on first use and inputs are truncated to
//! fit, so the store also works against pre-existing tables with narrower
//! columns.

use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::connection::ConnectionProvider;
use crate::error::{is_duplicate_key, BusError};
use crate::table::TableName;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Record that `address` subscribes to `topic`. Idempotent.
    async fn register_subscriber(&self, topic: &str, address: &str) -> Result<(), BusError>;

    /// Remove a subscription. A no-op if it does not exist.
    async fn unregister_subscriber(&self, topic: &str, address: &str) -> Result<(), BusError>;

    /// All addresses subscribed to `topic`.
    async fn subscriber_addresses(&self, topic: &str) -> Result<Vec<String>, BusError>;
}

pub struct MySqlSubscriptionStore {
    provider: Arc<ConnectionProvider>,
    table: TableName,
    /// `(topic width, address width)`, discovered at first use.
    widths: OnceCell<(usize, usize)>,
}

impl MySqlSubscriptionStore {
    pub async fn new(
        provider: Arc<ConnectionProvider>,
        table: TableName,
        ensure_tables_created: bool,
    ) -> Result<Self, BusError> {
        let store = Self {
            provider,
            table,
            widths: OnceCell::new(),
        };
        if ensure_tables_created {
            store.ensure_table_is_created().await?;
        }
        Ok(store)
    }

    async fn ensure_table_is_created(&self) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20 `topic` VARCHAR(200) NOT NULL,\n\
             \x20 `address` VARCHAR(200) NOT NULL,\n\
             \x20 PRIMARY KEY (`topic`, `address`)\n\
             )",
            self.table.qualified()
        );
        conn.execute_script(&ddl).await?;
        conn.complete().await
    }

    async fn column_widths(&self) -> Result<(usize, usize), BusError> {
        self.widths
            .get_or_try_init(|| self.discover_widths())
            .await
            .map(|widths| *widths)
    }

    async fn discover_widths(&self) -> Result<(usize, usize), BusError> {
        let rows = sqlx::query(
            "SELECT COLUMN_NAME, CHARACTER_MAXIMUM_LENGTH FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
             AND COLUMN_NAME IN ('topic', 'address')",
        )
        .bind(self.table.schema.as_deref())
        .bind(&self.table.name)
        .fetch_all(self.provider.pool())
        .await
        .map_err(|e| BusError::db("failed to read subscription column widths", e))?;

        let mut topic = None;
        let mut address = None;
        for row in rows {
            let name: String = row
                .try_get("COLUMN_NAME")
                .map_err(|e| BusError::db("failed to read COLUMN_NAME column", e))?;
            // BIGINT UNSIGNED in MySQL 8's information schema.
            let width: Option<u64> = row
                .try_get("CHARACTER_MAXIMUM_LENGTH")
                .map_err(|e| BusError::db("failed to read CHARACTER_MAXIMUM_LENGTH column", e))?;
            let width = usize::try_from(width.unwrap_or(0)).unwrap_or(0);
            match name.to_lowercase().as_str() {
                "topic" => topic = Some(width),
                "address" => address = Some(width),
                _ => {}
            }
        }

        match (topic, address) {
            (Some(t), Some(a)) if t > 0 && a > 0 => Ok((t, a)),
            _ => Err(BusError::SchemaMismatch {
                reason: format!(
                    "{} is missing the 'topic'/'address' VARCHAR columns",
                    self.table
                ),
            }),
        }
    }
}

#[async_trait]
impl SubscriptionStore for MySqlSubscriptionStore {
    async fn register_subscriber(&self, topic: &str, address: &str) -> Result<(), BusError> {
        let (topic_width, address_width) = self.column_widths().await?;
        let sql = format!(
            "INSERT INTO {} (`topic`, `address`) VALUES (?, ?)",
            self.table.qualified()
        );
        let result = sqlx::query(&sql)
            .bind(truncate_chars(topic, topic_width))
            .bind(truncate_chars(address, address_width))
            .execute(self.provider.pool())
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already registered.
            Err(e) if is_duplicate_key(&e) => Ok(()),
            Err(e) => Err(BusError::db(
                format!("failed to register subscriber for '{topic}'"),
                e,
            )),
        }
    }

    async fn unregister_subscriber(&self, topic: &str, address: &str) -> Result<(), BusError> {
        let (topic_width, address_width) = self.column_widths().await?;
        let sql = format!(
            "DELETE FROM {} WHERE `topic` = ? AND `address` = ?",
            self.table.qualified()
        );
        sqlx::query(&sql)
            .bind(truncate_chars(topic, topic_width))
            .bind(truncate_chars(address, address_width))
            .execute(self.provider.pool())
            .await
            .map_err(|e| {
                BusError::db(format!("failed to unregister subscriber for '{topic}'"), e)
            })?;
        Ok(())
    }

    async fn subscriber_addresses(&self, topic: &str) -> Result<Vec<String>, BusError> {
        let (topic_width, _) = self.column_widths().await?;
        let sql = format!(
            "SELECT `address` FROM {} WHERE `topic` = ?",
            self.table.qualified()
        );
        let rows = sqlx::query(&sql)
            .bind(truncate_chars(topic, topic_width))
            .fetch_all(self.provider.pool())
            .await
            .map_err(|e| BusError::db(format!("failed to list subscribers of '{topic}'"), e))?;

        let mut addresses = Vec::with_capacity(rows.len());
        for row in rows {
            let address: String = row
                .try_get("address")
                .map_err(|e| BusError::db("failed to read 'address' column", e))?;
            addresses.push(address);
        }
        Ok(addresses)
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &value[..byte_index],
        None => value,
    }
}
