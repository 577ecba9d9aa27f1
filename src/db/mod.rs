//! Database access layer.
//!
//! This module provides the resilient call path:
//! - Connection pool registry, one pool per endpoint key
//! - Call wrapper with timeouts, retries and instrumentation
//! - Retry/backoff policy and error classification
//! - Saturation tracking and the structured SQL log
//! - Row decoding and parameter binding

pub mod call_log;
pub mod classify;
pub mod executor;
pub mod params;
pub mod pool;
pub mod retry;
pub mod saturation;
pub mod types;
pub mod wrapped;

pub use call_log::{CallRecord, SQL_LOG_TARGET, ServerIdentity, sanitize_sql};
pub use classify::ErrorClassifier;
pub use executor::{CallTarget, CallWrapper};
pub use pool::{ConnectionRegistry, Connector, DbPool, Driver, EndpointPool, SqlxConnector};
pub use retry::RetryPolicy;
pub use saturation::{ActiveConnections, ConnectionLease, SaturationOutcome, SaturationState};
pub use wrapped::{DatabaseConnections, Databases, WrappedConnection};
