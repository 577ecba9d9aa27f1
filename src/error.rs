//! Error types for the resilient database layer.
//!
//! Two layers of errors exist:
//! - [`RawDbError`] is what a driver call produced, before classification. It keeps the
//!   full driver text so retry signatures and classification rules can match on it.
//! - [`DbError`] is what callers see. Neither `Display` nor `Debug` shows the SQL or its
//!   parameters; the diagnostic payload sits behind the opaque [`Diagnostics`] handle and
//!   is only read by the SQL log.

use crate::models::QueryParam;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Fixed message for calls that exceeded their deadline.
pub const TIMEOUT_MESSAGE: &str = "A required service was not able to respond in time. \
    This condition can occur under heavy platform load or might indicate an overly \
    expensive request. If it continues, contact support.";

/// Fixed message for transient connection failures that outlived the retry budget.
pub const UNAVAILABLE_MESSAGE: &str = "A required service is temporarily unavailable. \
    Try the request again later.";

pub const DUPLICATE_KEY_MESSAGE: &str =
    "The object could not be created because a duplicate already exists.";

pub const INVALID_REFERENCE_MESSAGE: &str = "The requested object could not be retrieved \
    because an ID value provided was not valid. Provide a valid object ID to continue.";

pub const DANGLING_REFERENCE_MESSAGE: &str = "The object could not be created because the \
    input references an object ID that does not exist. Verify all IDs in the request \
    input to continue.";

/// How a raw driver failure came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawErrorKind {
    /// The database or the wire reported an error.
    Driver,
    /// The call did not finish before its deadline.
    Timeout,
    /// The rows returned did not fit the requested operation kind.
    ResultShape,
}

/// Failure reported by a driver call, before classification.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RawDbError {
    pub kind: RawErrorKind,
    pub message: String,
    /// Debug rendering of the driver error. Plays the role of a stack trace when
    /// matching retry signatures.
    pub detail: Option<String>,
    /// e.g. "23505" for a unique violation
    pub sql_state: Option<String>,
}

impl RawDbError {
    /// Create a driver error from its message.
    pub fn driver(message: impl Into<String>) -> Self {
        Self {
            kind: RawErrorKind::Driver,
            message: message.into(),
            detail: None,
            sql_state: None,
        }
    }

    /// Create the error reported when a call exceeds its deadline.
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: RawErrorKind::Timeout,
            message: format!(
                "TimeoutError: operation timed out after {}ms",
                after.as_millis()
            ),
            detail: None,
            sql_state: None,
        }
    }

    /// Create a result-shape error (e.g. no row for a single-row call).
    pub fn result_shape(message: impl Into<String>) -> Self {
        Self {
            kind: RawErrorKind::ResultShape,
            message: message.into(),
            detail: None,
            sql_state: None,
        }
    }

    /// Attach a detail payload.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == RawErrorKind::Timeout
    }

    /// Case-sensitive substring match against the message and the detail.
    pub fn contains(&self, needle: &str) -> bool {
        self.message.contains(needle)
            || self
                .detail
                .as_deref()
                .is_some_and(|detail| detail.contains(needle))
    }
}

impl From<sqlx::Error> for RawDbError {
    fn from(err: sqlx::Error) -> Self {
        let detail = format!("{:?}", err);
        match err {
            sqlx::Error::Database(db_err) => Self {
                kind: RawErrorKind::Driver,
                message: db_err.message().to_string(),
                detail: Some(detail),
                sql_state: db_err.code().map(|c| c.to_string()),
            },
            sqlx::Error::PoolTimedOut => Self {
                kind: RawErrorKind::Timeout,
                message: "TimeoutError: pool timed out while waiting for an open connection"
                    .to_string(),
                detail: Some(detail),
                sql_state: None,
            },
            sqlx::Error::RowNotFound => {
                Self::result_shape("No data returned from the query.").with_detail(detail)
            }
            sqlx::Error::Io(io_err) => {
                Self::driver(format!("I/O error: {}", io_err)).with_detail(detail)
            }
            other => Self::driver(other.to_string()).with_detail(detail),
        }
    }
}

/// Category of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Caller programming error (e.g. missing SQL)
    InvalidCall,
    /// Matched a retryable signature
    TransientConnection,
    /// Exceeded the query deadline
    Timeout,
    DuplicateKey,
    /// Bad identifier format
    InvalidReference,
    /// Foreign-key violation
    DanglingReference,
    /// Misconfigured database, endpoint or URI
    Configuration,
    Internal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidCall => "invalid_call",
            Self::TransientConnection => "transient_connection",
            Self::Timeout => "timeout",
            Self::DuplicateKey => "duplicate_key",
            Self::InvalidReference => "invalid_reference",
            Self::DanglingReference => "dangling_reference",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Diagnostic payload kept with a classified error. Logged, never displayed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
    pub sql: String,
    pub sql_args: Vec<QueryParam>,
    pub db: String,
    /// ISO-8601
    pub start_time: String,
    pub time_elapsed_ms: u64,
    pub original_stack: Option<String>,
}

/// Opaque handle on the diagnostic payload of a [`DbError`].
///
/// Only the SQL log inside this crate can read it; `Debug` shows nothing.
pub struct Diagnostics(Box<ErrorDetail>);

impl Diagnostics {
    fn new(detail: ErrorDetail) -> Self {
        Self(Box::new(detail))
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Diagnostics(..)")
    }
}

/// User-facing error returned by every wrapped call.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid function call: {message}")]
    InvalidCall { message: String },

    #[error("{message}")]
    ServiceUnavailable {
        message: String,
        /// `Timeout` or `TransientConnection`
        cause: ErrorCategory,
        diagnostics: Option<Diagnostics>,
    },

    #[error("{}", DUPLICATE_KEY_MESSAGE)]
    DuplicateKey { diagnostics: Option<Diagnostics> },

    #[error("{}", INVALID_REFERENCE_MESSAGE)]
    InvalidReference { diagnostics: Option<Diagnostics> },

    #[error("{}", DANGLING_REFERENCE_MESSAGE)]
    DanglingReference { diagnostics: Option<Diagnostics> },

    #[error("An internal server error occurred: {message}")]
    Internal {
        message: String,
        diagnostics: Option<Diagnostics>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Database '{database}' is not configured")]
    DatabaseNotFound { database: String },

    #[error("Database '{database}' has no {access} endpoint configured")]
    EndpointNotConfigured {
        database: String,
        access: &'static str,
    },
}

impl DbError {
    /// Create an invalid call error.
    pub fn invalid_call(message: impl Into<String>) -> Self {
        Self::InvalidCall {
            message: message.into(),
        }
    }

    /// Create the fixed timeout error.
    pub(crate) fn timeout(detail: Option<ErrorDetail>) -> Self {
        Self::ServiceUnavailable {
            message: TIMEOUT_MESSAGE.to_string(),
            cause: ErrorCategory::Timeout,
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create the fixed error for exhausted transient failures.
    pub(crate) fn unavailable(detail: Option<ErrorDetail>) -> Self {
        Self::ServiceUnavailable {
            message: UNAVAILABLE_MESSAGE.to_string(),
            cause: ErrorCategory::TransientConnection,
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create a duplicate key error.
    pub(crate) fn duplicate_key(detail: Option<ErrorDetail>) -> Self {
        Self::DuplicateKey {
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create an invalid reference error.
    pub(crate) fn invalid_reference(detail: Option<ErrorDetail>) -> Self {
        Self::InvalidReference {
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create a dangling reference error.
    pub(crate) fn dangling_reference(detail: Option<ErrorDetail>) -> Self {
        Self::DanglingReference {
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create an internal error wrapping a driver message.
    pub(crate) fn internal(message: impl Into<String>, detail: Option<ErrorDetail>) -> Self {
        Self::Internal {
            message: message.into(),
            diagnostics: detail.map(Diagnostics::new),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a database not found error.
    pub fn database_not_found(database: impl Into<String>) -> Self {
        Self::DatabaseNotFound {
            database: database.into(),
        }
    }

    /// Create an error for a missing read or write endpoint.
    pub fn endpoint_not_configured(database: impl Into<String>, access: &'static str) -> Self {
        Self::EndpointNotConfigured {
            database: database.into(),
            access,
        }
    }

    /// Get the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidCall { .. } => ErrorCategory::InvalidCall,
            Self::ServiceUnavailable { cause, .. } => *cause,
            Self::DuplicateKey { .. } => ErrorCategory::DuplicateKey,
            Self::InvalidReference { .. } => ErrorCategory::InvalidReference,
            Self::DanglingReference { .. } => ErrorCategory::DanglingReference,
            Self::Internal { .. } => ErrorCategory::Internal,
            Self::Configuration { .. }
            | Self::DatabaseNotFound { .. }
            | Self::EndpointNotConfigured { .. } => ErrorCategory::Configuration,
        }
    }

    /// Whether this is a service-unavailable error (timeout or exhausted retries).
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }

    /// Diagnostic payload for the SQL log. Not part of the public surface.
    pub(crate) fn internal_detail(&self) -> Option<&ErrorDetail> {
        match self {
            Self::ServiceUnavailable { diagnostics, .. }
            | Self::DuplicateKey { diagnostics }
            | Self::InvalidReference { diagnostics }
            | Self::DanglingReference { diagnostics }
            | Self::Internal { diagnostics, .. } => diagnostics.as_ref().map(|d| &*d.0),
            _ => None,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
