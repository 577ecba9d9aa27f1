//! Connection-related data models.
//!
//! This module defines how a connection URI is identified: its database type, the
//! endpoint key used to share pools, and a display-safe rendering for logs.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Read or write side of a logical database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical identity of an endpoint: (database, user, host).
///
/// Two URIs with the same key share one pool even if they differ in password,
/// port or query options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub database: String,
    pub user: String,
    pub host: String,
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.database, self.user, self.host)
    }
}

/// A parsed connection URI.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Contains sensitive data - never log
    uri: String,
    pub db_type: DatabaseType,
    pub key: EndpointKey,
}

impl Endpoint {
    /// Parse a connection URI into its endpoint identity.
    pub fn parse(uri: &str) -> DbResult<Self> {
        let db_type = DatabaseType::from_connection_string(uri).ok_or_else(|| {
            DbError::configuration(format!(
                "Unknown database type in connection string: {}",
                mask_password(uri)
            ))
        })?;

        let key = match db_type {
            // SQLite has no user or host; the file path is the identity
            DatabaseType::SQLite => {
                let rest = uri
                    .strip_prefix("sqlite://")
                    .or_else(|| uri.strip_prefix("sqlite:"))
                    .unwrap_or(uri);
                let path = rest.split('?').next().unwrap_or(rest);
                EndpointKey {
                    database: path.to_string(),
                    user: String::new(),
                    host: String::new(),
                }
            }
            DatabaseType::PostgreSQL | DatabaseType::MySQL => {
                let url = Url::parse(uri).map_err(|e| {
                    DbError::configuration(format!(
                        "Invalid connection URL {}: {}",
                        mask_password(uri),
                        e
                    ))
                })?;
                EndpointKey {
                    database: url.path().trim_start_matches('/').to_string(),
                    user: url.username().to_string(),
                    host: url.host_str().unwrap_or_default().to_string(),
                }
            }
        };

        Ok(Self {
            uri: uri.to_string(),
            db_type,
            key,
        })
    }

    /// The full connection URI, credentials included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Get a display-safe version of the connection URI (password masked).
    pub fn masked_uri(&self) -> String {
        mask_password(&self.uri)
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("uri", &self.masked_uri())
            .field("db_type", &self.db_type)
            .field("key", &self.key)
            .finish()
    }
}

/// Replace the password of a URL with `****`. Strings that do not parse are
/// returned unchanged.
pub fn mask_password(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) if url.password().is_some() => {
            if url.set_password(Some("****")).is_ok() {
                url.to_string()
            } else {
                uri.to_string()
            }
        }
        _ => uri.to_string(),
    }
}
