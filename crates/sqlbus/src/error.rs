/// Errors that can occur in the bus persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("persistence error: {reason}")]
    Persistence {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Optimistic-concurrency mismatch or a competing writer got there first.
    #[error("concurrency conflict: {reason}")]
    Conflict { reason: String },

    /// The live schema does not match what this crate expects and cannot be
    /// repaired by an idempotent create.
    #[error("schema mismatch: {reason}")]
    SchemaMismatch { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("operation cancelled")]
    Cancelled {
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("bus is shutting down")]
    ShuttingDown,
}

impl BusError {
    /// Map a sqlx error into a `Persistence` error with context.
    pub(crate) fn db(reason: impl Into<String>, source: sqlx::Error) -> Self {
        BusError::Persistence {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Duplicate key (`ER_DUP_ENTRY`).
pub const ER_DUP_ENTRY: u16 = 1062;
/// Lock deadlock (`ER_LOCK_DEADLOCK`).
pub const ER_LOCK_DEADLOCK: u16 = 1213;
/// Database already exists (`ER_DB_CREATE_EXISTS`).
pub const ER_DB_CREATE_EXISTS: u16 = 1007;
/// Unknown table on DROP (`ER_BAD_TABLE_ERROR`).
pub const ER_BAD_TABLE: u16 = 1051;
/// Multiple primary keys defined (`ER_MULTIPLE_PRI_KEY`).
pub const ER_MULTIPLE_PRI_KEY: u16 = 1068;

/// Extract the MySQL server error number from a sqlx error, if the error
/// originated from the server.
pub fn mysql_error_number(err: &sqlx::Error) -> Option<u16> {
    err.as_database_error()
        .and_then(|db| db.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>())
        .map(|my| my.number())
}

/// Whether the error is an InnoDB lock deadlock (error 1213).
pub fn is_deadlock(err: &sqlx::Error) -> bool {
    mysql_error_number(err) == Some(ER_LOCK_DEADLOCK)
}

/// Whether the error is a duplicate-key violation (error 1062).
pub fn is_duplicate_key(err: &sqlx::Error) -> bool {
    mysql_error_number(err) == Some(ER_DUP_ENTRY)
}
