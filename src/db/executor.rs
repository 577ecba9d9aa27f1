//! Call wrapper: the execution core around every database call.
//!
//! Each call runs through a bounded state machine:
//!
//! ```text
//! Attempting --ok--------------------------> Succeeded
//!     |  \--error, not retryable or budget spent --> Failed
//!     \--error, retryable, budget left --> Backoff --sleep--> Attempting
//! ```
//!
//! Every attempt updates saturation tracking, counts `sqlQuery`, observes the
//! elapsed-time histogram and holds the `sqlConcurrentQueries` gauge through an
//! RAII guard, so a cancelled call still releases it. A call makes at most
//! `max_retries + 1` attempts.

use crate::config::{Config, SqlLogSettings};
use crate::db::call_log::{CallRecord, ServerIdentity, SqlCallRecord, should_log};
use crate::db::classify::ErrorClassifier;
use crate::db::pool::EndpointPool;
use crate::db::retry::RetryPolicy;
use crate::db::saturation::SaturationOutcome;
use crate::error::{DbError, DbResult, ErrorCategory, RawDbError};
use crate::metrics::{
    MetricsSink, SQL_CONCURRENT_QUERIES, SQL_CONNECTION_MAX, SQL_CONNECTION_WAITED, SQL_ERROR,
    SQL_QUERY, SQL_QUERY_RETRY, SQL_QUERY_TIME_ELAPSED_MS, SQL_QUERY_TIMEOUT,
};
use crate::models::{OperationKind, QueryOutput, QueryParam};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

/// Where a call goes: a logical database, its endpoint pool and its deadline.
#[derive(Debug, Clone)]
pub struct CallTarget {
    pub database: String,
    pub pool: Arc<EndpointPool>,
    pub query_timeout: Duration,
}

impl CallTarget {
    pub fn new(database: impl Into<String>, pool: Arc<EndpointPool>, query_timeout: Duration) -> Self {
        Self {
            database: database.into(),
            pool,
            query_timeout,
        }
    }
}

enum CallState {
    Attempting,
    /// Holds the number of the retry about to run (1-based)
    Backoff(u32),
    Succeeded(QueryOutput),
    Failed(DbError),
}

/// Keeps `sqlConcurrentQueries` raised for the lifetime of one attempt.
struct ConcurrentQueryGuard<'a> {
    metrics: &'a dyn MetricsSink,
    db: &'a str,
}

impl<'a> ConcurrentQueryGuard<'a> {
    fn new(metrics: &'a dyn MetricsSink, db: &'a str) -> Self {
        metrics.increment_gauge(SQL_CONCURRENT_QUERIES, db);
        Self { metrics, db }
    }
}

impl Drop for ConcurrentQueryGuard<'_> {
    fn drop(&mut self) {
        self.metrics.decrement_gauge(SQL_CONCURRENT_QUERIES, self.db);
    }
}

/// Wraps driver calls with timeouts, retries, classification, logging and metrics.
#[derive(Debug)]
pub struct CallWrapper {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    log: SqlLogSettings,
    max_connect_wait: Duration,
    metrics: Arc<dyn MetricsSink>,
    identity: ServerIdentity,
}

impl CallWrapper {
    /// Create a wrapper from the loaded configuration.
    pub fn new(config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        let policy = RetryPolicy::from_settings(&config.db);
        Self {
            classifier: ErrorClassifier::from_policy(&policy),
            policy,
            log: config.log.sql,
            max_connect_wait: config.db.max_connect_wait(),
            metrics,
            identity: ServerIdentity::detect(config.app_name_or_default()),
        }
    }

    /// Replace the retry policy (and the classifier's signature set with it).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.classifier = ErrorClassifier::from_policy(&policy);
        self.policy = policy;
        self
    }

    pub fn with_identity(mut self, identity: ServerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Execute one statement with the full wrapping.
    pub async fn execute(
        &self,
        kind: OperationKind,
        target: &CallTarget,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryOutput> {
        if sql.trim().is_empty() {
            return Err(DbError::invalid_call("sql is required"));
        }

        let db = target.database.as_str();
        let mut call = CallRecord::new(
            db,
            target.pool.endpoint().masked_uri(),
            sql,
            params.to_vec(),
        );
        let mut state = CallState::Attempting;

        loop {
            state = match state {
                CallState::Attempting => self.attempt(kind, target, &mut call).await,
                CallState::Backoff(retry) => {
                    let delay = self.policy.backoff(retry);
                    debug!(
                        db = %db,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    call.retries = retry;
                    CallState::Attempting
                }
                CallState::Succeeded(output) => return Ok(output),
                CallState::Failed(error) => return Err(error),
            };
        }
    }

    async fn attempt(
        &self,
        kind: OperationKind,
        target: &CallTarget,
        call: &mut CallRecord,
    ) -> CallState {
        let db = target.database.as_str();
        self.check_saturation(target);

        call.start_time = Utc::now();
        let started = Instant::now();
        let in_flight = ConcurrentQueryGuard::new(self.metrics.as_ref(), db);

        debug!(
            db = %db,
            kind = %kind,
            retry = call.retries,
            params = call.params.len(),
            "Executing statement"
        );

        let result = match timeout(
            target.query_timeout,
            target.pool.execute(kind, &call.sql, &call.params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RawDbError::timeout(target.query_timeout)),
        };

        let elapsed = started.elapsed();
        self.metrics.increment_counter(SQL_QUERY, db);
        self.metrics
            .observe_histogram(SQL_QUERY_TIME_ELAPSED_MS, elapsed_ms(elapsed) as f64, db);

        let next = match result {
            Ok(output) => {
                if should_log(&self.log, true) {
                    SqlCallRecord::new(&self.identity, call, elapsed_ms(elapsed), true).emit();
                }
                CallState::Succeeded(output)
            }
            Err(error) if self.policy.should_retry(&error, call.retries) => {
                warn!(
                    db = %db,
                    retry = call.retries + 1,
                    max_retries = self.policy.max_retries,
                    signature = self.policy.matching_signature(&error).unwrap_or_default(),
                    elapsed_ms = elapsed_ms(elapsed),
                    "Retryable database error, will retry"
                );
                if should_log(&self.log, false) {
                    SqlCallRecord::new(&self.identity, call, elapsed_ms(elapsed), false)
                        .with_error(error.message.clone(), None)
                        .emit();
                }
                self.metrics.increment_counter(SQL_QUERY_RETRY, db);
                CallState::Backoff(call.retries + 1)
            }
            Err(error) => CallState::Failed(self.fail(call, &error, elapsed)),
        };

        drop(in_flight);
        next
    }

    fn fail(&self, call: &CallRecord, error: &RawDbError, elapsed: Duration) -> DbError {
        let db = call.database.as_str();
        let classified = self.classifier.classify(error, call, elapsed);

        if classified.category() == ErrorCategory::Timeout {
            self.metrics.increment_counter(SQL_QUERY_TIMEOUT, db);
        }
        self.metrics.increment_counter(SQL_ERROR, db);

        if should_log(&self.log, false) {
            SqlCallRecord::new(&self.identity, call, elapsed_ms(elapsed), false)
                .with_error(classified.to_string(), classified.internal_detail())
                .emit();
        }
        debug!(
            db = %db,
            category = %classified.category(),
            retries = call.retries,
            "Database call failed"
        );
        classified
    }

    fn check_saturation(&self, target: &CallTarget) {
        let pool = &target.pool;
        let db = target.database.as_str();
        let outcome = pool
            .saturation()
            .check(pool.settings().max, self.max_connect_wait);

        if let SaturationOutcome::MaxExceeded { first_report: true } = outcome {
            warn!(
                db = %db,
                endpoint = %pool.key(),
                max = pool.settings().max,
                max_wait_ms = self.max_connect_wait.as_millis() as u64,
                "Connection pool saturated past the maximum wait"
            );
            self.metrics.increment_counter(SQL_CONNECTION_MAX, db);
        }
        if outcome.is_saturated() {
            self.metrics.increment_counter(SQL_CONNECTION_WAITED, db);
        }
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
