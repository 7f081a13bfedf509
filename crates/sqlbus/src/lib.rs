//! MySQL-backed message bus persistence.
//!
//! One MySQL database carries the complete runtime state of an
//! asynchronous messaging system:
//!
//! - a durable FIFO-with-priority queue per destination, leased to
//!   workers with visibility timing, TTLs and optional per-key ordering
//!   ([`MySqlTransport`]);
//! - a saga store with optimistic concurrency and indexed correlation
//!   lookup, plus subscription, timeout and data-bus stores
//!   ([`stores`]);
//! - a TTL-bounded distributed exclusive-access lock
//!   ([`ExclusiveAccessLock`]).
//!
//! There is no push channel: workers poll [`MySqlTransport::receive`] on
//! the cadence the surrounding runtime chooses. A receive leases exactly
//! one row under `FOR UPDATE`; the scope the caller passes in carries the
//! ack (delete) and nack (release) actions, and background sweepers
//! reclaim leases of crashed workers and delete rows past their TTL.

pub mod config;
pub mod connection;
pub mod error;
pub mod headers;
pub mod lock;
pub mod metrics;
pub mod scope;
pub mod stores;
pub mod sweeper;
pub mod table;
pub mod transport;

pub use config::{IsolationLevel, LockConfig, TransportConfig};
pub use connection::{BusConnection, ConnectionProvider};
pub use error::BusError;
pub use headers::TransportMessage;
pub use lock::ExclusiveAccessLock;
pub use metrics::BusMetrics;
pub use scope::TransactionScope;
pub use sweeper::QueueSweeper;
pub use table::TableName;
pub use transport::MySqlTransport;
