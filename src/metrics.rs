//! Metrics sink for SQL call instrumentation.
//!
//! The call wrapper reports through the [`MetricsSink`] trait only. Two sinks ship
//! with the crate:
//! - [`FacadeMetrics`] forwards to the `metrics` crate macros, so any installed
//!   recorder (Prometheus with the `prometheus` feature) picks the values up.
//! - [`InMemoryMetrics`] keeps plain counts, for tests and health snapshots.
//!
//! Every metric carries a single `db` label holding the logical database name.

use std::collections::HashMap;
use std::sync::Mutex;

/// Incremented for every attempt, retries included.
pub const SQL_QUERY: &str = "sqlQuery";
/// Incremented every time an attempt is retried.
pub const SQL_QUERY_RETRY: &str = "sqlQueryRetry";
/// Incremented once per call that ended in a timeout.
pub const SQL_QUERY_TIMEOUT: &str = "sqlQueryTimeout";
/// Incremented once per call that ended in an error.
pub const SQL_ERROR: &str = "sqlError";
/// Incremented for every attempt started while the pool was saturated.
pub const SQL_CONNECTION_WAITED: &str = "sqlConnectionWaited";
/// Incremented once per sustained saturation breach.
pub const SQL_CONNECTION_MAX: &str = "sqlConnectionMax";
/// Gauge of attempts currently in flight.
pub const SQL_CONCURRENT_QUERIES: &str = "sqlConcurrentQueries";
/// Histogram of attempt durations in milliseconds.
pub const SQL_QUERY_TIME_ELAPSED_MS: &str = "sqlQueryTimeElapsedMs";

/// Destination for SQL metrics.
pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn increment_counter(&self, name: &'static str, db: &str);

    fn increment_gauge(&self, name: &'static str, db: &str);

    fn decrement_gauge(&self, name: &'static str, db: &str);

    fn observe_histogram(&self, name: &'static str, value: f64, db: &str);
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeMetrics;

impl MetricsSink for FacadeMetrics {
    fn increment_counter(&self, name: &'static str, db: &str) {
        metrics::counter!(name, "db" => db.to_string()).increment(1);
    }

    fn increment_gauge(&self, name: &'static str, db: &str) {
        metrics::gauge!(name, "db" => db.to_string()).increment(1.0);
    }

    fn decrement_gauge(&self, name: &'static str, db: &str) {
        metrics::gauge!(name, "db" => db.to_string()).decrement(1.0);
    }

    fn observe_histogram(&self, name: &'static str, value: f64, db: &str) {
        metrics::histogram!(name, "db" => db.to_string()).record(value);
    }
}

type MetricKey = (&'static str, String);

#[derive(Debug, Default)]
struct Recorded {
    counters: HashMap<MetricKey, u64>,
    gauges: HashMap<MetricKey, f64>,
    histograms: HashMap<MetricKey, Vec<f64>>,
}

/// Sink that records values in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    recorded: Mutex<Recorded>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_recorded<T>(&self, f: impl FnOnce(&mut Recorded) -> T) -> T {
        // A poisoned lock still holds consistent counts
        let mut guard = match self.recorded.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Current value of a counter (0 if never incremented).
    pub fn counter(&self, name: &str, db: &str) -> u64 {
        self.with_recorded(|r| {
            r.counters
                .iter()
                .find(|((n, d), _)| *n == name && d == db)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        })
    }

    /// Current value of a gauge (0.0 if never touched).
    pub fn gauge(&self, name: &str, db: &str) -> f64 {
        self.with_recorded(|r| {
            r.gauges
                .iter()
                .find(|((n, d), _)| *n == name && d == db)
                .map(|(_, v)| *v)
                .unwrap_or(0.0)
        })
    }

    /// Observations recorded for a histogram, in order.
    pub fn histogram(&self, name: &str, db: &str) -> Vec<f64> {
        self.with_recorded(|r| {
            r.histograms
                .iter()
                .find(|((n, d), _)| *n == name && d == db)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        })
    }

    /// Number of observations recorded for a histogram.
    pub fn histogram_count(&self, name: &str, db: &str) -> usize {
        self.histogram(name, db).len()
    }

    /// Sum of every counter with this name, across databases.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.with_recorded(|r| {
            r.counters
                .iter()
                .filter(|((n, _), _)| *n == name)
                .map(|(_, v)| *v)
                .sum()
        })
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, db: &str) {
        self.with_recorded(|r| {
            *r.counters.entry((name, db.to_string())).or_default() += 1;
        });
    }

    fn increment_gauge(&self, name: &'static str, db: &str) {
        self.with_recorded(|r| {
            *r.gauges.entry((name, db.to_string())).or_default() += 1.0;
        });
    }

    fn decrement_gauge(&self, name: &'static str, db: &str) {
        self.with_recorded(|r| {
            *r.gauges.entry((name, db.to_string())).or_default() -= 1.0;
        });
    }

    fn observe_histogram(&self, name: &'static str, value: f64, db: &str) {
        self.with_recorded(|r| {
            r.histograms
                .entry((name, db.to_string()))
                .or_default()
                .push(value);
        });
    }
}

/// Install the Prometheus exporter with an HTTP listener serving `/metrics`.
#[cfg(feature = "prometheus")]
pub fn init_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(
        "Prometheus metrics server listening on http://{}/metrics",
        addr
    );
    Ok(())
}

/// No-op when the `prometheus` feature is disabled.
#[cfg(not(feature = "prometheus"))]
pub fn init_prometheus(
    addr: std::net::SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::warn!(
        %addr,
        "Metrics address given but the prometheus feature is not enabled"
    );
    Ok(())
}
