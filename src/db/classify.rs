//! Error classification.
//!
//! Maps a raw driver failure to the error callers see. Rules are checked in order
//! and the first match wins:
//!
//! 1. Timeout (`TimeoutError`, `ETIMEDOUT`, or a deadline overrun)
//! 2. Transient connection failure that outlived the retry budget
//! 3. Duplicate key
//! 4. Invalid input syntax (bad identifier)
//! 5. Foreign-key violation
//! 6. Anything else is internal
//!
//! Classification is pure. Metrics for timeouts are emitted by the call wrapper.

use crate::db::call_log::CallRecord;
use crate::db::retry::RetryPolicy;
use crate::error::{DbError, ErrorDetail, RawDbError};
use crate::models::truncate_params;
use std::time::Duration;

const TIMEOUT_MARKERS: &[&str] = &["TimeoutError", "ETIMEDOUT"];

const DUPLICATE_KEY_MARKERS: &[&str] = &[
    "duplicate key value violates unique constraint",
    // SQLite and MySQL spellings
    "UNIQUE constraint failed",
    "Duplicate entry",
];

const INVALID_REFERENCE_MARKERS: &[&str] = &["invalid input syntax"];

// PostgreSQL SQLSTATE codes, checked before the message text
const UNIQUE_VIOLATION: &str = "23505";
const INVALID_TEXT_REPRESENTATION: &str = "22P02";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const DANGLING_REFERENCE_MARKERS: &[&str] = &[
    "violates foreign key constraint",
    "FOREIGN KEY constraint failed",
    "a foreign key constraint fails",
];

/// Maps raw driver errors to classified errors.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    signatures: Vec<String>,
}

impl ErrorClassifier {
    /// Create a classifier that treats these signatures as transient.
    pub fn new(signatures: Vec<String>) -> Self {
        Self { signatures }
    }

    /// Share the retry policy's signature set.
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.signatures.clone())
    }

    /// Whether the error is a timeout.
    pub fn is_timeout(error: &RawDbError) -> bool {
        error.is_timeout() || TIMEOUT_MARKERS.iter().any(|m| error.contains(m))
    }

    fn is_transient(&self, error: &RawDbError) -> bool {
        self.signatures
            .iter()
            .any(|s| !s.is_empty() && error.contains(s))
    }

    /// Classify a failed attempt. `elapsed` is the attempt's duration.
    pub fn classify(&self, error: &RawDbError, call: &CallRecord, elapsed: Duration) -> DbError {
        let detail = ErrorDetail {
            kind: "sql",
            message: error.message.clone(),
            sql: call.sql.clone(),
            sql_args: truncate_params(&call.params),
            db: call.database.clone(),
            start_time: call.start_time_iso(),
            time_elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            original_stack: error.detail.clone(),
        };

        let matches = |sql_state: &str, markers: &[&str]| {
            error.sql_state.as_deref() == Some(sql_state)
                || markers.iter().any(|m| error.message.contains(m))
        };

        if Self::is_timeout(error) {
            DbError::timeout(Some(detail))
        } else if self.is_transient(error) {
            DbError::unavailable(Some(detail))
        } else if matches(UNIQUE_VIOLATION, DUPLICATE_KEY_MARKERS) {
            DbError::duplicate_key(Some(detail))
        } else if matches(INVALID_TEXT_REPRESENTATION, INVALID_REFERENCE_MARKERS) {
            DbError::invalid_reference(Some(detail))
        } else if matches(FOREIGN_KEY_VIOLATION, DANGLING_REFERENCE_MARKERS) {
            DbError::dangling_reference(Some(detail))
        } else {
            DbError::internal(error.message.clone(), Some(detail))
        }
    }
}
