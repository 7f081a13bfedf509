//! Qualified table names and idempotent schema DDL.
//!
//! MySQL has no `CREATE COLUMN IF NOT EXISTS` / `CREATE INDEX IF NOT EXISTS`,
//! so the helpers here render a short script that selects the object's
//! existence into a session variable, builds the DDL conditionally with
//! `IF(...)` and runs it through `PREPARE`/`EXECUTE`. The scripts are plain
//! statement sequences separated by the [`SCRIPT_SEPARATOR`] sentinel and are
//! executed by [`BusConnection::execute_script`](crate::connection::BusConnection::execute_script).

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::BusError;

/// Sentinel line separating the statements of a multi-statement script.
pub const SCRIPT_SEPARATOR: &str = "----";

/// A possibly schema-qualified MySQL table name.
///
/// Comparison and hashing are case-insensitive, matching how
/// `INFORMATION_SCHEMA` reports identifiers on default collations.
#[derive(Debug, Clone, Eq)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// A table in the connection's default schema.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    /// Parse `table`, `schema.table`, or either with backtick quoting.
    pub fn parse(input: &str) -> Result<Self, BusError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BusError::InvalidConfig {
                reason: "table name must not be empty".to_string(),
            });
        }

        let segments = split_identifier(trimmed)?;
        match segments.as_slice() {
            [name] => Ok(TableName::new(name.clone())),
            [schema, name] => Ok(TableName::with_schema(schema.clone(), name.clone())),
            _ => Err(BusError::InvalidConfig {
                reason: format!("'{trimmed}' has more than one qualifier"),
            }),
        }
    }

    /// The backtick-quoted form used in statements: `` `schema`.`table` ``
    /// or `` `table` ``.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.name)),
            None => quote_ident(&self.name),
        }
    }

    /// The schema operand for `INFORMATION_SCHEMA` lookups: a quoted string
    /// literal when qualified, `DATABASE()` otherwise.
    fn schema_expr(&self) -> String {
        match &self.schema {
            Some(schema) => quote_str(schema),
            None => "DATABASE()".to_string(),
        }
    }
}

impl PartialEq for TableName {
    fn eq(&self, other: &Self) -> bool {
        fn eq_ci(a: &str, b: &str) -> bool {
            a.to_lowercase() == b.to_lowercase()
        }
        eq_ci(&self.name, &other.name)
            && match (&self.schema, &other.schema) {
                (None, None) => true,
                (Some(a), Some(b)) => eq_ci(a, b),
                _ => false,
            }
    }
}

impl Hash for TableName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(schema) = &self.schema {
            schema.to_lowercase().hash(state);
        }
        self.name.to_lowercase().hash(state);
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

fn split_identifier(input: &str) -> Result<Vec<String>, BusError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '`' if !quoted && current.is_empty() => quoted = true,
            '`' if quoted => {
                // Doubled backtick is an escaped backtick inside a quoted name.
                if chars.peek() == Some(&'`') {
                    chars.next();
                    current.push('`');
                } else {
                    quoted = false;
                }
            }
            '.' if !quoted => {
                if current.is_empty() {
                    return Err(BusError::InvalidConfig {
                        reason: format!("'{input}' has an empty name segment"),
                    });
                }
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }

    if quoted {
        return Err(BusError::InvalidConfig {
            reason: format!("'{input}' has an unterminated backtick quote"),
        });
    }
    if current.is_empty() {
        return Err(BusError::InvalidConfig {
            reason: format!("'{input}' has an empty name segment"),
        });
    }
    segments.push(current);
    Ok(segments)
}

/// Backtick-quote an identifier, doubling embedded backticks.
pub fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Single-quote a string literal, escaping quotes and backslashes.
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

fn conditional_ddl(exists_query: String, condition: &str, ddl: &str) -> String {
    [
        exists_query,
        format!(
            "SET @sqlbus_ddl = IF(@sqlbus_exists {condition}, {}, 'DO 0')",
            quote_str(ddl)
        ),
        "PREPARE sqlbus_stmt FROM @sqlbus_ddl".to_string(),
        "EXECUTE sqlbus_stmt".to_string(),
        "DEALLOCATE PREPARE sqlbus_stmt".to_string(),
    ]
    .join(&format!("\n{SCRIPT_SEPARATOR}\n"))
}

fn column_exists_query(table: &TableName, column: &str) -> String {
    format!(
        "SELECT COUNT(*) INTO @sqlbus_exists FROM INFORMATION_SCHEMA.COLUMNS \
         WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND COLUMN_NAME = {}",
        table.schema_expr(),
        quote_str(&table.name),
        quote_str(column),
    )
}

fn index_exists_query(table: &TableName, index: &str) -> String {
    format!(
        "SELECT COUNT(DISTINCT INDEX_NAME) INTO @sqlbus_exists FROM INFORMATION_SCHEMA.STATISTICS \
         WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND INDEX_NAME = {}",
        table.schema_expr(),
        quote_str(&table.name),
        quote_str(index),
    )
}

/// Script that adds a column unless it already exists.
pub fn create_column_if_not_exists(table: &TableName, column: &str, definition: &str) -> String {
    conditional_ddl(
        column_exists_query(table, column),
        "= 0",
        &format!(
            "ALTER TABLE {} ADD COLUMN {} {definition}",
            table.qualified(),
            quote_ident(column)
        ),
    )
}

/// Script that drops a column if it exists.
pub fn drop_column_if_exists(table: &TableName, column: &str) -> String {
    conditional_ddl(
        column_exists_query(table, column),
        "> 0",
        &format!(
            "ALTER TABLE {} DROP COLUMN {}",
            table.qualified(),
            quote_ident(column)
        ),
    )
}

/// Script that creates an index unless one with the same name exists.
/// `columns` is the raw column list, directions included, e.g.
/// `` `priority` DESC, `visible` ASC ``.
pub fn create_index_if_not_exists(table: &TableName, index: &str, columns: &str) -> String {
    conditional_ddl(
        index_exists_query(table, index),
        "= 0",
        &format!(
            "CREATE INDEX {} ON {} ({columns})",
            quote_ident(index),
            table.qualified()
        ),
    )
}

/// Script that drops an index if it exists.
pub fn drop_index_if_exists(table: &TableName, index: &str) -> String {
    conditional_ddl(
        index_exists_query(table, index),
        "> 0",
        &format!(
            "DROP INDEX {} ON {}",
            quote_ident(index),
            table.qualified()
        ),
    )
}
