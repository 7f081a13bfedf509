//! Saga store: durable long-running workflow state with optimistic
//! concurrency on a revision counter and an indexed correlation lookup.
//!
//! Two tables: the data table holds `(id, revision, data)`; the index table
//! holds one row per correlation property, compound-keyed on
//! `(saga_type, prop_key, prop_value, saga_id)` so `find` is a single
//! indexed probe. Updates rewrite the saga's index rows in the same
//! transaction that bumps the revision.

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::connection::{BusConnection, ConnectionProvider};
use crate::error::{is_duplicate_key, BusError};
use crate::table::{self, TableName};
use std::sync::Arc;

/// Widest accepted saga type name, per the index table's `VARCHAR(40)`.
pub const MAX_SAGA_TYPE_CHARS: usize = 40;
/// Widest accepted correlation property name or value (`VARCHAR(200)`
/// each; together with the type the compound key stays under MySQL's
/// index size limit).
pub const MAX_CORRELATION_CHARS: usize = 200;

/// One saga instance's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaData {
    pub id: Uuid,
    pub revision: i32,
    pub data: Vec<u8>,
}

/// A correlation property the saga can be found by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationProperty {
    pub name: String,
    pub value: String,
}

impl CorrelationProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Insert a new saga (revision must be 0). A duplicate id or a
    /// correlation collision is a [`BusError::Conflict`].
    async fn insert(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<(), BusError>;

    /// Update a saga whose current revision is `data.revision`. Returns the
    /// new revision. A revision mismatch is a [`BusError::Conflict`].
    async fn update(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<i32, BusError>;

    /// Delete a saga at the given revision. A mismatch is a
    /// [`BusError::Conflict`].
    async fn delete(&self, data: &SagaData) -> Result<(), BusError>;

    /// Find a saga by correlation property. The property name `id` looks up
    /// the data table directly.
    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaData>, BusError>;
}

pub struct MySqlSagaStore {
    provider: Arc<ConnectionProvider>,
    data_table: TableName,
    index_table: TableName,
}

impl MySqlSagaStore {
    pub async fn new(
        provider: Arc<ConnectionProvider>,
        data_table: TableName,
        index_table: TableName,
        ensure_tables_created: bool,
    ) -> Result<Self, BusError> {
        let store = Self {
            provider,
            data_table,
            index_table,
        };
        if ensure_tables_created {
            store.ensure_tables_are_created().await?;
        }
        Ok(store)
    }

    async fn ensure_tables_are_created(&self) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let data_ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20 `id` CHAR(36) NOT NULL,\n\
             \x20 `revision` INT NOT NULL,\n\
             \x20 `data` LONGBLOB NOT NULL,\n\
             \x20 PRIMARY KEY (`id`)\n\
             )",
            self.data_table.qualified()
        );
        conn.execute_script(&data_ddl).await?;

        let index_ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n\
             \x20 `saga_type` VARCHAR(40) NOT NULL,\n\
             \x20 `prop_key` VARCHAR(200) NOT NULL,\n\
             \x20 `prop_value` VARCHAR(200) NOT NULL,\n\
             \x20 `saga_id` CHAR(36) NOT NULL,\n\
             \x20 PRIMARY KEY (`saga_type`, `prop_key`, `prop_value`, `saga_id`)\n\
             )",
            self.index_table.qualified()
        );
        conn.execute_script(&index_ddl).await?;
        conn.execute_script(&table::create_index_if_not_exists(
            &self.index_table,
            "idx_saga_id",
            "`saga_id`",
        ))
        .await?;
        conn.complete().await
    }

    async fn insert_index_rows(
        &self,
        conn: &mut BusConnection,
        saga_type: &str,
        saga_id: Uuid,
        correlation: &[CorrelationProperty],
    ) -> Result<(), BusError> {
        let sql = format!(
            "INSERT INTO {} (`saga_type`, `prop_key`, `prop_value`, `saga_id`) \
             VALUES (?, ?, ?, ?)",
            self.index_table.qualified()
        );
        for prop in correlation {
            let result = sqlx::query(&sql)
                .bind(saga_type)
                .bind(&prop.name)
                .bind(&prop.value)
                .bind(saga_id.to_string())
                .execute(conn.executor()?)
                .await;
            match result {
                Ok(_) => {}
                Err(e) if is_duplicate_key(&e) => {
                    return Err(BusError::Conflict {
                        reason: format!(
                            "correlation {saga_type}/{}={} already indexed",
                            prop.name, prop.value
                        ),
                    });
                }
                Err(e) => {
                    return Err(BusError::db(
                        format!("failed to index saga {saga_id}"),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStore for MySqlSagaStore {
    async fn insert(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<(), BusError> {
        if data.revision != 0 {
            return Err(BusError::Conflict {
                reason: format!(
                    "saga {} has revision {}, only revision 0 can be inserted",
                    data.id, data.revision
                ),
            });
        }
        validate_correlation(saga_type, correlation)?;

        let mut conn = self.provider.open().await?;
        let sql = format!(
            "INSERT INTO {} (`id`, `revision`, `data`) VALUES (?, 0, ?)",
            self.data_table.qualified()
        );
        let result = sqlx::query(&sql)
            .bind(data.id.to_string())
            .bind(&data.data)
            .execute(conn.executor()?)
            .await;
        match result {
            Ok(_) => {}
            Err(e) if is_duplicate_key(&e) => {
                return Err(BusError::Conflict {
                    reason: format!("saga {} already exists", data.id),
                });
            }
            Err(e) => {
                return Err(BusError::db(format!("failed to insert saga {}", data.id), e));
            }
        }

        self.insert_index_rows(&mut conn, saga_type, data.id, correlation)
            .await?;
        conn.complete().await
    }

    async fn update(
        &self,
        saga_type: &str,
        data: &SagaData,
        correlation: &[CorrelationProperty],
    ) -> Result<i32, BusError> {
        validate_correlation(saga_type, correlation)?;
        let new_revision = data.revision + 1;

        let mut conn = self.provider.open().await?;
        let sql = format!(
            "UPDATE {} SET `revision` = ?, `data` = ? WHERE `id` = ? AND `revision` = ?",
            self.data_table.qualified()
        );
        let affected = sqlx::query(&sql)
            .bind(new_revision)
            .bind(&data.data)
            .bind(data.id.to_string())
            .bind(data.revision)
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to update saga {}", data.id), e))?
            .rows_affected();
        if affected == 0 {
            return Err(BusError::Conflict {
                reason: format!(
                    "saga {} is not at revision {} (updated or deleted concurrently)",
                    data.id, data.revision
                ),
            });
        }

        let delete_sql = format!(
            "DELETE FROM {} WHERE `saga_id` = ?",
            self.index_table.qualified()
        );
        sqlx::query(&delete_sql)
            .bind(data.id.to_string())
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to reindex saga {}", data.id), e))?;
        self.insert_index_rows(&mut conn, saga_type, data.id, correlation)
            .await?;

        conn.complete().await?;
        Ok(new_revision)
    }

    async fn delete(&self, data: &SagaData) -> Result<(), BusError> {
        let mut conn = self.provider.open().await?;
        let sql = format!(
            "DELETE FROM {} WHERE `id` = ? AND `revision` = ?",
            self.data_table.qualified()
        );
        let affected = sqlx::query(&sql)
            .bind(data.id.to_string())
            .bind(data.revision)
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to delete saga {}", data.id), e))?
            .rows_affected();
        if affected == 0 {
            return Err(BusError::Conflict {
                reason: format!(
                    "saga {} is not at revision {} (updated or deleted concurrently)",
                    data.id, data.revision
                ),
            });
        }

        let index_sql = format!(
            "DELETE FROM {} WHERE `saga_id` = ?",
            self.index_table.qualified()
        );
        sqlx::query(&index_sql)
            .bind(data.id.to_string())
            .execute(conn.executor()?)
            .await
            .map_err(|e| BusError::db(format!("failed to unindex saga {}", data.id), e))?;
        conn.complete().await
    }

    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<SagaData>, BusError> {
        let mut conn = self.provider.open().await?;
        let row = if property.eq_ignore_ascii_case("id") {
            let Ok(id) = Uuid::parse_str(value) else {
                return Ok(None);
            };
            let sql = format!(
                "SELECT `id`, `revision`, `data` FROM {} WHERE `id` = ?",
                self.data_table.qualified()
            );
            sqlx::query(&sql)
                .bind(id.to_string())
                .fetch_optional(conn.executor()?)
                .await
        } else {
            let sql = format!(
                "SELECT d.`id`, d.`revision`, d.`data` FROM {} d \
                 JOIN {} i ON i.`saga_id` = d.`id` \
                 WHERE i.`saga_type` = ? AND i.`prop_key` = ? AND i.`prop_value` = ?",
                self.data_table.qualified(),
                self.index_table.qualified()
            );
            sqlx::query(&sql)
                .bind(saga_type)
                .bind(property)
                .bind(value)
                .fetch_optional(conn.executor()?)
                .await
        }
        .map_err(|e| {
            BusError::db(
                format!("failed to find saga by {saga_type}/{property}"),
                e,
            )
        })?;

        conn.complete().await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let id: String = row
                    .try_get("id")
                    .map_err(|e| BusError::db("failed to read 'id' column", e))?;
                let revision: i32 = row
                    .try_get("revision")
                    .map_err(|e| BusError::db("failed to read 'revision' column", e))?;
                let data: Vec<u8> = row
                    .try_get("data")
                    .map_err(|e| BusError::db("failed to read 'data' column", e))?;
                let id = Uuid::parse_str(&id).map_err(|e| BusError::Persistence {
                    reason: format!("saga id '{id}' is not a UUID"),
                    source: Some(Box::new(e)),
                })?;
                Ok(Some(SagaData { id, revision, data }))
            }
        }
    }
}

fn validate_correlation(
    saga_type: &str,
    correlation: &[CorrelationProperty],
) -> Result<(), BusError> {
    if saga_type.chars().count() > MAX_SAGA_TYPE_CHARS {
        return Err(BusError::MalformedMessage {
            reason: format!("saga type '{saga_type}' exceeds {MAX_SAGA_TYPE_CHARS} characters"),
            source: None,
        });
    }
    for prop in correlation {
        if prop.name.chars().count() > MAX_CORRELATION_CHARS {
            return Err(BusError::MalformedMessage {
                reason: format!(
                    "correlation property name '{}' exceeds {MAX_CORRELATION_CHARS} characters",
                    prop.name
                ),
                source: None,
            });
        }
        if prop.value.chars().count() > MAX_CORRELATION_CHARS {
            return Err(BusError::MalformedMessage {
                reason: format!(
                    "correlation value for '{}' exceeds {MAX_CORRELATION_CHARS} characters",
                    prop.name
                ),
                source: None,
            });
        }
    }
    Ok(())
}
