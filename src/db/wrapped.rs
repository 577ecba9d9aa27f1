//! Wrapped connections handed to callers.
//!
//! A [`WrappedConnection`] binds the call wrapper to one target (database name and
//! endpoint pool) and exposes one method per operation kind. [`Databases`] maps each
//! configured database name to its read/write pair.

use crate::db::executor::{CallTarget, CallWrapper};
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::{Access, OperationKind, QueryOutput, QueryParam, Row};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Connection to one side of a logical database, with every call wrapped.
#[derive(Debug, Clone)]
pub struct WrappedConnection {
    wrapper: Arc<CallWrapper>,
    target: CallTarget,
}

impl WrappedConnection {
    pub fn new(wrapper: Arc<CallWrapper>, target: CallTarget) -> Self {
        Self { wrapper, target }
    }

    /// Logical database name.
    pub fn database(&self) -> &str {
        &self.target.database
    }

    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    /// Run a statement with an explicit operation kind.
    pub async fn execute(
        &self,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryOutput> {
        self.wrapper.execute(kind, &self.target, sql, params).await
    }

    /// Exactly one row.
    pub async fn one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Row> {
        let output = self.execute(OperationKind::One, sql, params).await?;
        output
            .into_rows()
            .into_iter()
            .next()
            .ok_or_else(|| DbError::internal("No data returned from the query.", None))
    }

    /// Zero or one row.
    pub async fn one_or_none(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        let output = self.execute(OperationKind::OneOrNone, sql, params).await?;
        Ok(output.into_rows().into_iter().next())
    }

    /// One or more rows.
    pub async fn many(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let output = self.execute(OperationKind::Many, sql, params).await?;
        Ok(output.into_rows())
    }

    /// Any number of rows.
    pub async fn many_or_none(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        let output = self.execute(OperationKind::ManyOrNone, sql, params).await?;
        Ok(output.into_rows())
    }

    /// Alias of [`many_or_none`](Self::many_or_none).
    pub async fn any(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.many_or_none(sql, params).await
    }

    /// No result rows. Returns the affected row count.
    pub async fn none(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        match self.execute(OperationKind::None, sql, params).await? {
            QueryOutput::Done { rows_affected } => Ok(rows_affected),
            _ => Ok(0),
        }
    }

    /// Stream rows and call `f` for each, in order, once the call succeeded.
    ///
    /// Returns the rows, like the other multi-row calls.
    pub async fn each<F>(&self, sql: &str, params: &[QueryParam], mut f: F) -> DbResult<Vec<Row>>
    where
        F: FnMut(&Row, usize),
    {
        let rows = self
            .execute(OperationKind::Stream, sql, params)
            .await?
            .into_rows();
        for (index, row) in rows.iter().enumerate() {
            f(row, index);
        }
        Ok(rows)
    }

    /// Any number of rows, each mapped through `f`.
    pub async fn map<T, F>(&self, sql: &str, params: &[QueryParam], f: F) -> DbResult<Vec<T>>
    where
        F: FnMut(Row) -> T,
    {
        let rows = self.many_or_none(sql, params).await?;
        Ok(rows.into_iter().map(f).collect())
    }

    /// The raw sqlx pool, for driver calls outside the wrapper.
    pub fn unwrapped(&self) -> Option<&DbPool> {
        self.target.pool.sqlx_pool()
    }
}

/// Read and write connections of one logical database.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConnections {
    pub read: Option<WrappedConnection>,
    pub write: Option<WrappedConnection>,
}

impl DatabaseConnections {
    /// Get one side, or an error naming what is missing.
    pub fn get(&self, access: Access) -> DbResult<&WrappedConnection> {
        let connection = match access {
            Access::Read => self.read.as_ref(),
            Access::Write => self.write.as_ref(),
        };
        connection.ok_or_else(|| {
            let database = self
                .read
                .as_ref()
                .or(self.write.as_ref())
                .map(|c| c.database().to_string())
                .unwrap_or_default();
            DbError::endpoint_not_configured(database, access.as_str())
        })
    }
}

/// Wrapped connections keyed by logical database name.
#[derive(Debug, Clone, Default)]
pub struct Databases {
    connections: BTreeMap<String, DatabaseConnections>,
}

impl Databases {
    pub fn new(connections: BTreeMap<String, DatabaseConnections>) -> Self {
        Self { connections }
    }

    pub fn get(&self, database: &str) -> DbResult<&DatabaseConnections> {
        self.connections
            .get(database)
            .ok_or_else(|| DbError::database_not_found(database))
    }

    /// Connection to the read endpoint of a database.
    pub fn read(&self, database: &str) -> DbResult<&WrappedConnection> {
        self.connection(database, Access::Read)
    }

    /// Connection to the write endpoint of a database.
    pub fn write(&self, database: &str) -> DbResult<&WrappedConnection> {
        self.connection(database, Access::Write)
    }

    pub fn connection(&self, database: &str, access: Access) -> DbResult<&WrappedConnection> {
        self.get(database)?
            .get(access)
            .map_err(|_| DbError::endpoint_not_configured(database, access.as_str()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
