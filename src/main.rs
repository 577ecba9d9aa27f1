//! resilient-db - Main entry point.
//!
//! Runs one SQL statement through the resilient database layer and prints the
//! result as JSON. Pools, timeouts, retries and logging come from the TOML
//! configuration file.

use clap::Parser;
use resilient_db::config::{Cli, Config};
use resilient_db::db::{CallWrapper, ConnectionRegistry, SqlxConnector};
use resilient_db::metrics::{FacadeMetrics, init_prometheus};
use resilient_db::models::QueryParam;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging. Logs go to stderr, results to stdout.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    }
}

fn parse_params(raw: &[String]) -> Result<Vec<QueryParam>, serde_json::Error> {
    raw.iter()
        .map(|p| serde_json::from_str(p).map(QueryParam::from_json))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_tracing(&cli);

    let config = Config::from_file(&cli.config)?;
    let params = parse_params(&cli.params)?;

    if let Some(addr) = cli.metrics_addr {
        init_prometheus(addr).map_err(|e| e.to_string())?;
    }

    info!(
        app_name = %config.app_name_or_default(),
        databases = config.db.databases.len(),
        "Starting resilient-db v{}",
        env!("CARGO_PKG_VERSION")
    );

    let connector = Arc::new(SqlxConnector::new(config.app_name_or_default()));
    let registry = ConnectionRegistry::new(config.db.clone(), connector);
    let wrapper = Arc::new(CallWrapper::new(&config, Arc::new(FacadeMetrics)));
    let databases = registry.connect_all(&wrapper)?;

    let connection = databases.connection(&cli.database, cli.access())?;
    let result = connection.execute(cli.kind, &cli.sql, &params).await;

    registry.close_all().await;

    match result {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!(
                database = %cli.database,
                category = %e.category(),
                "Statement failed"
            );
            // Display only; the diagnostic payload stays in the SQL log
            Err(format!("{} ({})", e, e.category()).into())
        }
    }
}
