//! Connection pool registry.
//!
//! One pooled connection resource exists per endpoint key (database, user, host).
//! Logical databases whose read and write URIs resolve to the same key share it.
//! Pools are created lazily on first request and live until [`ConnectionRegistry::close_all`].
//!
//! Pool creation goes through the [`Connector`] trait; [`SqlxConnector`] builds
//! database-specific sqlx pools (PgPool, MySqlPool, SqlitePool) to keep full type support.
//!
//! # Concurrency
//!
//! - The pool map is a `std::sync::RwLock`; pool creation is synchronous (lazy
//!   connect), so no lock is ever held across an await.
//! - A write-locked re-check prevents two callers from creating the same pool.

use crate::config::{DbSettings, PoolSettings};
use crate::db::executor::{CallTarget, CallWrapper};
use crate::db::saturation::{ActiveConnections, SaturationState};
use crate::db::types::RowToJson;
use crate::db::wrapped::{DatabaseConnections, Databases, WrappedConnection};
use crate::db::params;
use crate::error::{DbError, DbResult, RawDbError};
use crate::models::{
    Access, DatabaseType, Endpoint, EndpointKey, OperationKind, QueryOutput, QueryParam,
};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::{
    MySqlPool, PgPool, SqlitePool, mysql::MySqlConnectOptions, mysql::MySqlPoolOptions,
    postgres::PgConnectOptions, postgres::PgPoolOptions, sqlite::SqliteConnectOptions,
    sqlite::SqlitePoolOptions,
};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Database-specific connection pool (avoids AnyPool limitations).
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
}

impl DbPool {
    /// Close the connection pool.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
        }
    }

    /// Get the database type for this pool.
    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
        }
    }
}

/// A pooled connection resource the call wrapper can run statements on.
///
/// Implementations take a lease from `active` for as long as they hold a physical
/// connection, so saturation tracking sees every checkout.
#[async_trait]
pub trait Driver: Send + Sync + std::fmt::Debug {
    async fn execute(
        &self,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
        active: &Arc<ActiveConnections>,
    ) -> Result<QueryOutput, RawDbError>;

    /// The underlying sqlx pool, for pass-through driver calls.
    fn sqlx_pool(&self) -> Option<&DbPool> {
        None
    }

    async fn close(&self) {}
}

#[async_trait]
impl Driver for DbPool {
    async fn execute(
        &self,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
        active: &Arc<ActiveConnections>,
    ) -> Result<QueryOutput, RawDbError> {
        match self {
            DbPool::MySql(p) => mysql::run(p, kind, sql, params, active).await,
            DbPool::Postgres(p) => postgres::run(p, kind, sql, params, active).await,
            DbPool::SQLite(p) => sqlite::run(p, kind, sql, params, active).await,
        }
    }

    fn sqlx_pool(&self) -> Option<&DbPool> {
        Some(self)
    }

    async fn close(&self) {
        DbPool::close(self).await;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.

mod mysql {
    use super::*;
    use sqlx::Executor;

    pub async fn run(
        pool: &MySqlPool,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
        active: &Arc<ActiveConnections>,
    ) -> Result<QueryOutput, RawDbError> {
        let mut conn = pool.acquire().await?;
        let _lease = active.acquired();

        match kind {
            OperationKind::None => {
                // Without params, run unprepared (some statements cannot be prepared)
                let result = if params.is_empty() {
                    (&mut *conn).execute(sql).await?
                } else {
                    params::mysql_query(sql, params).execute(&mut *conn).await?
                };
                Ok(QueryOutput::Done {
                    rows_affected: result.rows_affected(),
                })
            }
            OperationKind::Stream => {
                let mut rows = Vec::new();
                let mut stream = params::mysql_query(sql, params).fetch(&mut *conn);
                while let Some(row) = stream.try_next().await? {
                    rows.push(row.to_json_map());
                }
                QueryOutput::from_rows(kind, rows)
            }
            _ => {
                let rows = params::mysql_query(sql, params)
                    .fetch_all(&mut *conn)
                    .await?;
                QueryOutput::from_rows(kind, rows.iter().map(RowToJson::to_json_map).collect())
            }
        }
    }
}

mod postgres {
    use super::*;
    use sqlx::Executor;

    pub async fn run(
        pool: &PgPool,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
        active: &Arc<ActiveConnections>,
    ) -> Result<QueryOutput, RawDbError> {
        let mut conn = pool.acquire().await?;
        let _lease = active.acquired();

        match kind {
            OperationKind::None => {
                let result = if params.is_empty() {
                    (&mut *conn).execute(sql).await?
                } else {
                    params::postgres_query(sql, params)
                        .execute(&mut *conn)
                        .await?
                };
                Ok(QueryOutput::Done {
                    rows_affected: result.rows_affected(),
                })
            }
            OperationKind::Stream => {
                let mut rows = Vec::new();
                let mut stream = params::postgres_query(sql, params).fetch(&mut *conn);
                while let Some(row) = stream.try_next().await? {
                    rows.push(row.to_json_map());
                }
                QueryOutput::from_rows(kind, rows)
            }
            _ => {
                let rows = params::postgres_query(sql, params)
                    .fetch_all(&mut *conn)
                    .await?;
                QueryOutput::from_rows(kind, rows.iter().map(RowToJson::to_json_map).collect())
            }
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::Executor;

    pub async fn run(
        pool: &SqlitePool,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
        active: &Arc<ActiveConnections>,
    ) -> Result<QueryOutput, RawDbError> {
        let mut conn = pool.acquire().await?;
        let _lease = active.acquired();

        match kind {
            OperationKind::None => {
                let result = if params.is_empty() {
                    (&mut *conn).execute(sql).await?
                } else {
                    params::sqlite_query(sql, params).execute(&mut *conn).await?
                };
                Ok(QueryOutput::Done {
                    rows_affected: result.rows_affected(),
                })
            }
            OperationKind::Stream => {
                let mut rows = Vec::new();
                let mut stream = params::sqlite_query(sql, params).fetch(&mut *conn);
                while let Some(row) = stream.try_next().await? {
                    rows.push(row.to_json_map());
                }
                QueryOutput::from_rows(kind, rows)
            }
            _ => {
                let rows = params::sqlite_query(sql, params)
                    .fetch_all(&mut *conn)
                    .await?;
                QueryOutput::from_rows(kind, rows.iter().map(RowToJson::to_json_map).collect())
            }
        }
    }
}

/// Creates the pooled resource behind an endpoint.
pub trait Connector: Send + Sync + std::fmt::Debug {
    fn connect(&self, endpoint: &Endpoint, settings: &PoolSettings)
    -> DbResult<Arc<dyn Driver>>;
}

/// Builds lazily-connecting sqlx pools. Must be called inside a Tokio runtime.
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    app_name: String,
}

impl SqlxConnector {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }

    fn invalid_uri(endpoint: &Endpoint, error: sqlx::Error) -> DbError {
        DbError::configuration(format!(
            "Invalid {} connection string {}: {}",
            endpoint.db_type,
            endpoint.masked_uri(),
            error
        ))
    }
}

impl Connector for SqlxConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        settings: &PoolSettings,
    ) -> DbResult<Arc<dyn Driver>> {
        let idle_timeout = Some(settings.idle_timeout);

        let pool = match endpoint.db_type {
            DatabaseType::MySQL => {
                let options = MySqlConnectOptions::from_str(endpoint.uri())
                    .map_err(|e| Self::invalid_uri(endpoint, e))?
                    .charset("utf8mb4");

                DbPool::MySql(
                    MySqlPoolOptions::new()
                        .min_connections(settings.min)
                        .max_connections(settings.max)
                        .acquire_timeout(settings.query_timeout)
                        .idle_timeout(idle_timeout)
                        .connect_lazy_with(options),
                )
            }
            DatabaseType::PostgreSQL => {
                let options = PgConnectOptions::from_str(endpoint.uri())
                    .map_err(|e| Self::invalid_uri(endpoint, e))?
                    .application_name(&self.app_name);

                DbPool::Postgres(
                    PgPoolOptions::new()
                        .min_connections(settings.min)
                        .max_connections(settings.max)
                        .acquire_timeout(settings.query_timeout)
                        .idle_timeout(idle_timeout)
                        .connect_lazy_with(options),
                )
            }
            DatabaseType::SQLite => {
                let options = SqliteConnectOptions::from_str(endpoint.uri())
                    .map_err(|e| Self::invalid_uri(endpoint, e))?
                    .create_if_missing(true);

                DbPool::SQLite(
                    SqlitePoolOptions::new()
                        .min_connections(settings.min)
                        .max_connections(settings.max)
                        .acquire_timeout(settings.query_timeout)
                        .idle_timeout(idle_timeout)
                        .connect_lazy_with(options),
                )
            }
        };

        Ok(Arc::new(pool))
    }
}

/// The shared pool behind one endpoint key, with its saturation state.
#[derive(Debug)]
pub struct EndpointPool {
    endpoint: Endpoint,
    settings: PoolSettings,
    driver: Arc<dyn Driver>,
    saturation: SaturationState,
}

impl EndpointPool {
    pub fn new(endpoint: Endpoint, settings: PoolSettings, driver: Arc<dyn Driver>) -> Self {
        Self {
            endpoint,
            settings,
            driver,
            saturation: SaturationState::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn key(&self) -> &EndpointKey {
        &self.endpoint.key
    }

    /// Settings of the logical database that created this pool.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn saturation(&self) -> &SaturationState {
        &self.saturation
    }

    /// Get current number of checked-out connections.
    pub fn active_connections(&self) -> usize {
        self.saturation.active().current()
    }

    pub fn sqlx_pool(&self) -> Option<&DbPool> {
        self.driver.sqlx_pool()
    }

    /// Run one statement on the driver, without timeout or classification.
    pub(crate) async fn execute(
        &self,
        kind: OperationKind,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<QueryOutput, RawDbError> {
        self.driver
            .execute(kind, sql, params, self.saturation.active())
            .await
    }
}

/// Owner of every endpoint pool. Passed around by `Arc`.
#[derive(Debug)]
pub struct ConnectionRegistry {
    settings: DbSettings,
    connector: Arc<dyn Connector>,
    pools: RwLock<HashMap<EndpointKey, Arc<EndpointPool>>>,
    /// First registration per database name wins.
    query_timeouts: RwLock<HashMap<String, Duration>>,
}

impl ConnectionRegistry {
    pub fn new(settings: DbSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            pools: RwLock::new(HashMap::new()),
            query_timeouts: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    fn read_pools(&self) -> RwLockReadGuard<'_, HashMap<EndpointKey, Arc<EndpointPool>>> {
        self.pools.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_pools(&self) -> RwLockWriteGuard<'_, HashMap<EndpointKey, Arc<EndpointPool>>> {
        self.pools
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve_settings(&self, database: &str) -> PoolSettings {
        self.settings
            .pool_settings(database)
            .unwrap_or_else(|| self.settings.global_pool_settings())
    }

    /// Get the shared pool for a URI, creating it on first request.
    ///
    /// Registers the database's query timeout as a side effect.
    pub fn get_pool(&self, database: &str, uri: &str) -> DbResult<Arc<EndpointPool>> {
        let endpoint = Endpoint::parse(uri)?;
        let settings = self.resolve_settings(database);
        self.register_query_timeout(database, settings.query_timeout);

        if let Some(pool) = self.read_pools().get(&endpoint.key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.write_pools();
        // Re-check under the write lock
        if let Some(pool) = pools.get(&endpoint.key) {
            return Ok(Arc::clone(pool));
        }

        info!(
            database = %database,
            endpoint = %endpoint.key,
            db_type = %endpoint.db_type,
            max = settings.max,
            min = settings.min,
            "Creating connection pool"
        );

        let driver = self.connector.connect(&endpoint, &settings)?;
        let key = endpoint.key.clone();
        let pool = Arc::new(EndpointPool::new(endpoint, settings, driver));
        pools.insert(key, Arc::clone(&pool));
        Ok(pool)
    }

    fn register_query_timeout(&self, database: &str, timeout: Duration) {
        let mut timeouts = self
            .query_timeouts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        timeouts.entry(database.to_string()).or_insert_with(|| {
            debug!(database = %database, timeout_ms = timeout.as_millis() as u64, "Registered query timeout");
            timeout
        });
    }

    /// Query timeout for a database: the registered value, else the resolved setting.
    pub fn query_timeout(&self, database: &str) -> Duration {
        let registered = self
            .query_timeouts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(database)
            .copied();
        registered.unwrap_or_else(|| self.resolve_settings(database).query_timeout)
    }

    /// Get the number of distinct endpoint pools.
    pub fn pool_count(&self) -> usize {
        self.read_pools().len()
    }

    /// Snapshot of every pool.
    pub fn pools(&self) -> Vec<Arc<EndpointPool>> {
        self.read_pools().values().cloned().collect()
    }

    /// Build the read/write connection pair for every configured database.
    pub fn connect_all(&self, wrapper: &Arc<CallWrapper>) -> DbResult<Databases> {
        let mut databases = BTreeMap::new();

        for (name, db) in &self.settings.databases {
            let mut connections = DatabaseConnections::default();
            for access in [Access::Read, Access::Write] {
                let Some(uri) = db.uri(access) else {
                    continue;
                };
                let pool = self.get_pool(name, uri)?;
                let target = CallTarget::new(name.clone(), pool, self.query_timeout(name));
                let connection = WrappedConnection::new(Arc::clone(wrapper), target);
                match access {
                    Access::Read => connections.read = Some(connection),
                    Access::Write => connections.write = Some(connection),
                }
            }
            databases.insert(name.clone(), connections);
        }

        info!(
            databases = databases.len(),
            pools = self.pool_count(),
            "Database connections initialized"
        );
        Ok(Databases::new(databases))
    }

    /// Close all pools and clear the registry.
    pub async fn close_all(&self) {
        let drained: Vec<(EndpointKey, Arc<EndpointPool>)> = self.write_pools().drain().collect();
        for (key, pool) in drained {
            info!(endpoint = %key, "Closing connection pool");
            pool.driver.close().await;
        }
        info!("All connection pools closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct NoopDriver;

    #[async_trait]
    impl Driver for NoopDriver {
        async fn execute(
            &self,
            _kind: OperationKind,
            _sql: &str,
            _params: &[QueryParam],
            _active: &Arc<ActiveConnections>,
        ) -> Result<QueryOutput, RawDbError> {
            Ok(QueryOutput::Many(Vec::new()))
        }
    }

    #[derive(Debug, Default)]
    struct CountingConnector {
        created: AtomicUsize,
    }

    impl Connector for CountingConnector {
        fn connect(
            &self,
            _endpoint: &Endpoint,
            _settings: &PoolSettings,
        ) -> DbResult<Arc<dyn Driver>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopDriver))
        }
    }

    fn settings() -> DbSettings {
        let mut settings = DbSettings {
            query_timeout_ms: Some(20000),
            ..Default::default()
        };
        settings.databases.insert(
            "main".to_string(),
            DatabaseConfig {
                read: Some("postgres://app:a@db1/main".to_string()),
                write: Some("postgres://app:b@db1:6432/main".to_string()),
                max: Some(5),
                query_timeout_ms: Some(1000),
                ..Default::default()
            },
        );
        settings
    }

    #[test]
    fn test_get_pool_is_idempotent_by_key() {
        let connector = Arc::new(CountingConnector::default());
        let registry = ConnectionRegistry::new(settings(), connector.clone());

        let a = registry.get_pool("main", "postgres://app:a@db1/main").unwrap();
        let b = registry.get_pool("main", "postgres://app:b@db1:6432/main").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.pool_count(), 1);
        assert_eq!(connector.created.load(Ordering::SeqCst), 1);

        registry.get_pool("main", "postgres://other@db1/main").unwrap();
        assert_eq!(registry.pool_count(), 2);
    }

    #[test]
    fn test_pool_uses_database_settings() {
        let registry = ConnectionRegistry::new(settings(), Arc::new(CountingConnector::default()));
        let pool = registry.get_pool("main", "postgres://app@db1/main").unwrap();
        assert_eq!(pool.settings().max, 5);
        assert_eq!(pool.settings().query_timeout, Duration::from_millis(1000));
        assert_eq!(pool.active_connections(), 0);
        assert!(pool.sqlx_pool().is_none());
    }

    #[test]
    fn test_query_timeout_first_write_wins() {
        let registry = ConnectionRegistry::new(settings(), Arc::new(CountingConnector::default()));
        assert_eq!(registry.query_timeout("other"), Duration::from_millis(20000));

        registry.get_pool("main", "postgres://app@db1/main").unwrap();
        registry.register_query_timeout("main", Duration::from_millis(99));
        assert_eq!(registry.query_timeout("main"), Duration::from_millis(1000));
    }

    #[test]
    fn test_malformed_uri_is_configuration_error() {
        let registry = ConnectionRegistry::new(settings(), Arc::new(CountingConnector::default()));
        let result = registry.get_pool("main", "oracle://db1/main");
        assert!(matches!(result, Err(DbError::Configuration { .. })));
        assert_eq!(registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = ConnectionRegistry::new(settings(), Arc::new(CountingConnector::default()));
        registry.get_pool("main", "postgres://app@db1/main").unwrap();
        registry.close_all().await;
        assert_eq!(registry.pool_count(), 0);
    }

    #[tokio::test]
    async fn test_sqlx_connector_builds_lazy_sqlite_pool() {
        let connector = SqlxConnector::new("resilient-db-test");
        let endpoint = Endpoint::parse("sqlite::memory:").unwrap();
        let driver = connector
            .connect(&endpoint, &PoolSettings::default())
            .unwrap();
        let pool = driver.sqlx_pool().unwrap();
        assert_eq!(pool.db_type(), DatabaseType::SQLite);
        driver.close().await;
    }
}
