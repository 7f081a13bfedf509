//! Connection provider and the per-operation connection wrapper.
//!
//! Every bus operation runs on its own [`BusConnection`]. In the default
//! mode the wrapper owns an explicit transaction begun at the provider's
//! isolation level: `complete()` commits it, dropping the wrapper without
//! completing rolls it back. In ambient mode (`enlist_in_ambient_transaction`)
//! the wrapper is a plain autocommit connection and `complete()` is a no-op;
//! the surrounding scope owns the transaction boundaries.

use std::collections::HashMap;

use sqlx::mysql::{MySql, MySqlConnection, MySqlPool, MySqlPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{Executor, Row, Transaction};

use crate::config::IsolationLevel;
use crate::error::BusError;
use crate::table::{TableName, SCRIPT_SEPARATOR};

/// Opens [`BusConnection`]s against one MySQL database.
#[derive(Clone)]
pub struct ConnectionProvider {
    pool: MySqlPool,
    enlist_in_ambient_transaction: bool,
}

impl ConnectionProvider {
    /// Connect a new pool. The isolation level is applied once per physical
    /// connection with `SET SESSION TRANSACTION ISOLATION LEVEL`, so every
    /// transaction begun through this provider runs at that level.
    pub async fn connect(
        dsn: &str,
        isolation: IsolationLevel,
        enlist_in_ambient_transaction: bool,
    ) -> Result<Self, BusError> {
        let set_isolation = format!(
            "SET SESSION TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        );
        let pool = MySqlPoolOptions::new()
            .after_connect(move |conn, _meta| {
                let sql = set_isolation.clone();
                Box::pin(async move { conn.execute(sql.as_str()).await.map(|_| ()) })
            })
            .connect(dsn)
            .await
            .map_err(|e| BusError::db("failed to connect to MySQL", e))?;

        Ok(Self {
            pool,
            enlist_in_ambient_transaction,
        })
    }

    /// Wrap an existing pool. The caller is responsible for the pool's
    /// session isolation level in this case.
    pub fn from_pool(pool: MySqlPool, enlist_in_ambient_transaction: bool) -> Self {
        Self {
            pool,
            enlist_in_ambient_transaction,
        }
    }

    /// The underlying pool, for single-statement autocommit work
    /// (lease renewal, sweepers) that needs no wrapper.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Open a connection wrapper per the provider's mode.
    pub async fn open(&self) -> Result<BusConnection, BusError> {
        if self.enlist_in_ambient_transaction {
            let conn = self
                .pool
                .acquire()
                .await
                .map_err(|e| BusError::db("failed to acquire connection", e))?;
            Ok(BusConnection {
                inner: Inner::Ambient(conn),
            })
        } else {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| BusError::db("failed to begin transaction", e))?;
            Ok(BusConnection {
                inner: Inner::Transactional(Some(tx)),
            })
        }
    }
}

enum Inner {
    Transactional(Option<Transaction<'static, MySql>>),
    Ambient(PoolConnection<MySql>),
}

/// A single-operation connection. See the module docs for the two modes.
pub struct BusConnection {
    inner: Inner,
}

impl BusConnection {
    /// The raw connection for statement execution.
    pub(crate) fn executor(&mut self) -> Result<&mut MySqlConnection, BusError> {
        match &mut self.inner {
            Inner::Transactional(Some(tx)) => Ok(&mut *tx),
            Inner::Transactional(None) => Err(BusError::Persistence {
                reason: "connection already completed".to_string(),
                source: None,
            }),
            Inner::Ambient(conn) => Ok(&mut *conn),
        }
    }

    /// Commit the wrapped transaction. Idempotent; a no-op in ambient mode
    /// (the external transaction owner commits).
    pub async fn complete(&mut self) -> Result<(), BusError> {
        if let Inner::Transactional(slot) = &mut self.inner {
            if let Some(tx) = slot.take() {
                tx.commit()
                    .await
                    .map_err(|e| BusError::db("failed to commit transaction", e))?;
            }
        }
        Ok(())
    }

    /// Execute a multi-statement script sequentially on this connection.
    /// Statements are separated by a line containing only
    /// [`SCRIPT_SEPARATOR`].
    pub async fn execute_script(&mut self, script: &str) -> Result<(), BusError> {
        for statement in split_script(script) {
            let conn = self.executor()?;
            conn.execute(statement.as_str())
                .await
                .map_err(|e| BusError::db(format!("script statement failed: {statement}"), e))?;
        }
        Ok(())
    }

    /// Tables visible in the connection's current schema.
    pub async fn table_names(&mut self) -> Result<Vec<TableName>, BusError> {
        let conn = self.executor()?;
        let rows = sqlx::query(
            "SELECT TABLE_NAME FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = DATABASE()",
        )
        .fetch_all(conn)
        .await
        .map_err(|e| BusError::db("failed to list tables", e))?;

        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("TABLE_NAME")
                .map_err(|e| BusError::db("failed to read TABLE_NAME column", e))?;
            names.push(TableName::new(name));
        }
        Ok(names)
    }

    /// Column name → SQL data type for a table. Keys are lowercased so
    /// lookups are case-insensitive.
    pub async fn columns(&mut self, table: &TableName) -> Result<HashMap<String, String>, BusError> {
        let conn = self.executor()?;
        let rows = sqlx::query(
            "SELECT COLUMN_NAME, DATA_TYPE FROM INFORMATION_SCHEMA.COLUMNS \
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?",
        )
        .bind(table.schema.as_deref())
        .bind(&table.name)
        .fetch_all(conn)
        .await
        .map_err(|e| BusError::db(format!("failed to read columns of {table}"), e))?;

        let mut columns = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("COLUMN_NAME")
                .map_err(|e| BusError::db("failed to read COLUMN_NAME column", e))?;
            let data_type: String = row
                .try_get("DATA_TYPE")
                .map_err(|e| BusError::db("failed to read DATA_TYPE column", e))?;
            columns.insert(name.to_lowercase(), data_type);
        }
        Ok(columns)
    }

    /// Index name → comma-joined column list (in `SEQ_IN_INDEX` order) for a
    /// table. Keys are lowercased.
    pub async fn indexes(&mut self, table: &TableName) -> Result<HashMap<String, String>, BusError> {
        let conn = self.executor()?;
        let rows = sqlx::query(
            "SELECT INDEX_NAME, COLUMN_NAME FROM INFORMATION_SCHEMA.STATISTICS \
             WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ? \
             ORDER BY INDEX_NAME, SEQ_IN_INDEX",
        )
        .bind(table.schema.as_deref())
        .bind(&table.name)
        .fetch_all(conn)
        .await
        .map_err(|e| BusError::db(format!("failed to read indexes of {table}"), e))?;

        let mut indexes: HashMap<String, String> = HashMap::new();
        for row in rows {
            let index: String = row
                .try_get("INDEX_NAME")
                .map_err(|e| BusError::db("failed to read INDEX_NAME column", e))?;
            let column: String = row
                .try_get("COLUMN_NAME")
                .map_err(|e| BusError::db("failed to read COLUMN_NAME column", e))?;
            let entry = indexes.entry(index.to_lowercase()).or_default();
            if !entry.is_empty() {
                entry.push_str(", ");
            }
            entry.push_str(&column);
        }
        Ok(indexes)
    }
}

/// Split a script into its statements on [`SCRIPT_SEPARATOR`] lines.
fn split_script(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    for line in script.lines() {
        if line.trim() == SCRIPT_SEPARATOR {
            if !current.trim().is_empty() {
                statements.push(current.trim().to_string());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        statements.push(current.trim().to_string());
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_script_on_separator_lines() {
        let script = "SELECT 1\n----\nSELECT 2\n  ----  \nSELECT 3";
        assert_eq!(split_script(script), vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn split_script_skips_empty_statements() {
        let script = "----\nSELECT 1\n----\n----\n";
        assert_eq!(split_script(script), vec!["SELECT 1"]);
    }

    #[test]
    fn split_script_keeps_multiline_statements_together() {
        let script = "SELECT *\nFROM t\n----\nDO 0";
        assert_eq!(split_script(script), vec!["SELECT *\nFROM t", "DO 0"]);
    }

    #[test]
    fn dashes_inside_a_statement_do_not_split() {
        let script = "SELECT '----x'\n----\nDO 0";
        assert_eq!(split_script(script).len(), 2);
    }
}
