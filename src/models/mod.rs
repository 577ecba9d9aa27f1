//! Data models for the resilient database layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{Access, DatabaseType, Endpoint, EndpointKey, mask_password};
pub use query::{
    MAX_LOGGED_PARAMS, OperationKind, QueryOutput, QueryParam, Row, truncate_params,
};
