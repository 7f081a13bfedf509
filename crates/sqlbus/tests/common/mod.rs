//! Shared helpers for the MySQL integration tests.
//!
//! Every test is gated on `SQLBUS_TEST_DSN`; without it the tests print a
//! skip notice and pass, so the suite stays green on machines without a
//! database.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sqlbus::config::IsolationLevel;
use sqlbus::connection::ConnectionProvider;
use sqlbus::headers::TransportMessage;
use sqlbus::table::TableName;

static TABLE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The test database DSN, or `None` to skip.
pub fn test_dsn() -> Option<String> {
    init_tracing();
    match std::env::var("SQLBUS_TEST_DSN") {
        Ok(dsn) if !dsn.is_empty() => Some(dsn),
        _ => {
            eprintln!("skipping: SQLBUS_TEST_DSN is not set");
            None
        }
    }
}

/// A provider against the test database, or `None` to skip.
pub async fn test_provider() -> Option<Arc<ConnectionProvider>> {
    let dsn = test_dsn()?;
    let provider = ConnectionProvider::connect(&dsn, IsolationLevel::RepeatableRead, false)
        .await
        .expect("SQLBUS_TEST_DSN is set but the database is unreachable");
    Some(Arc::new(provider))
}

/// A table name unique to this test process and call site.
pub fn unique_table(prefix: &str) -> TableName {
    let n = TABLE_COUNTER.fetch_add(1, Ordering::Relaxed);
    TableName::new(format!("sqlbus_test_{prefix}_{}_{n}", std::process::id()))
}

/// Drop a table created by a test.
pub async fn drop_table(provider: &ConnectionProvider, table: &TableName) {
    let sql = format!("DROP TABLE IF EXISTS {}", table.qualified());
    let _ = sqlx::query(&sql).execute(provider.pool()).await;
}

/// Build a message with a UTF-8 body and the given headers.
pub fn message(body: &str, headers: &[(&str, &str)]) -> TransportMessage {
    let headers: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    TransportMessage::new(headers, body.as_bytes().to_vec())
}

/// The message body as text.
pub fn body_text(message: &TransportMessage) -> String {
    String::from_utf8(message.body.clone()).expect("message body should be UTF-8")
}
