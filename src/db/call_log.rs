//! Structured SQL call log.
//!
//! One record is built per attempt. Whether it is emitted depends on the
//! `[log.sql]` flags: `all` logs every attempt, `error` logs failed ones.
//! Records go to the `resilient_db::sql` tracing target as a JSON document.

use crate::config::SqlLogSettings;
use crate::error::ErrorDetail;
use crate::models::{QueryParam, truncate_params};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Tracing target for SQL call records.
pub const SQL_LOG_TARGET: &str = "resilient_db::sql";

/// SQL text is cut to this many characters in log records.
pub const MAX_LOGGED_SQL_CHARS: usize = 600;

/// Identity of the process emitting the records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub ip: String,
    pub hostname: String,
    pub service_name: String,
}

impl ServerIdentity {
    /// Resolve the local hostname and primary IPv4 address.
    pub fn detect(service_name: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            ip: local_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
            hostname,
            service_name: service_name.into(),
        }
    }
}

// Connecting a UDP socket only selects a route; nothing is sent.
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

/// Ephemeral state of one wrapped call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Logical database name
    pub database: String,
    /// Endpoint URI, password masked
    pub uri: String,
    pub sql: String,
    pub params: Vec<QueryParam>,
    /// Start of the current attempt
    pub start_time: DateTime<Utc>,
    pub retries: u32,
}

impl CallRecord {
    pub fn new(
        database: impl Into<String>,
        uri: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<QueryParam>,
    ) -> Self {
        Self {
            database: database.into(),
            uri: uri.into(),
            sql: sql.into(),
            params,
            start_time: Utc::now(),
            retries: 0,
        }
    }

    /// ISO-8601 rendering of the attempt start.
    pub fn start_time_iso(&self) -> String {
        self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Truncate SQL to 600 characters, turn newlines and tabs into spaces, and trim.
pub fn sanitize_sql(sql: &str) -> String {
    sql.chars()
        .take(MAX_LOGGED_SQL_CHARS)
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Whether an attempt with this outcome is logged.
pub fn should_log(settings: &SqlLogSettings, success: bool) -> bool {
    settings.all || (settings.error && !success)
}

/// One SQL log record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlCallRecord<'a> {
    pub event: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub server_ip: &'a str,
    pub server_hostname: &'a str,
    pub service_name: &'a str,
    pub db: &'a str,
    pub url: &'a str,
    pub sql: String,
    pub sql_args: Vec<QueryParam>,
    pub elapsed_ms: u64,
    pub start_time: String,
    pub num_retries: u32,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error_data: Option<&'a ErrorDetail>,
}

impl<'a> SqlCallRecord<'a> {
    pub fn new(
        identity: &'a ServerIdentity,
        call: &'a CallRecord,
        elapsed_ms: u64,
        success: bool,
    ) -> Self {
        Self {
            event: "sql",
            kind: "api",
            server_ip: &identity.ip,
            server_hostname: &identity.hostname,
            service_name: &identity.service_name,
            db: &call.database,
            url: &call.uri,
            sql: sanitize_sql(&call.sql),
            sql_args: truncate_params(&call.params),
            elapsed_ms,
            start_time: call.start_time_iso(),
            num_retries: call.retries,
            success,
            error: None,
            error_data: None,
        }
    }

    /// Attach the classified error message and its diagnostic payload.
    pub(crate) fn with_error(mut self, message: String, detail: Option<&'a ErrorDetail>) -> Self {
        self.error = Some(message);
        self.error_data = detail;
        self
    }

    /// Emit the record on the SQL log target.
    pub fn emit(&self) {
        let record = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize SQL log record");
                return;
            }
        };

        if self.success {
            tracing::info!(
                target: SQL_LOG_TARGET,
                db = %self.db,
                elapsed_ms = self.elapsed_ms,
                num_retries = self.num_retries,
                success = true,
                "{}",
                record
            );
        } else {
            tracing::error!(
                target: SQL_LOG_TARGET,
                db = %self.db,
                elapsed_ms = self.elapsed_ms,
                num_retries = self.num_retries,
                success = false,
                "{}",
                record
            );
        }
    }
}
