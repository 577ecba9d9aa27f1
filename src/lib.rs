//! Resilient database access library.
//!
//! Brokers SQL traffic to PostgreSQL, MySQL and SQLite through shared per-endpoint
//! pools, with per-call timeouts, retry/backoff on transient errors, error
//! classification, and metrics and log instrumentation around every call.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod models;

pub use config::Config;
pub use db::{CallWrapper, ConnectionRegistry, Databases, SqlxConnector, WrappedConnection};
pub use error::{DbError, DbResult};
