//! db-router - Main entry point.
//!
//! Connects a primary and its read replicas, then either executes a single
//! statement and prints the JSON result, or runs until interrupted while
//! logging a status snapshot at a fixed interval.

use db_router::config::Config;
use db_router::models::mask_connection_string;
use db_router::{AccessOptions, DataAccess, DbError, ExecuteOptions};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run_daemon(access: &DataAccess, config: &Config) {
    let mut ticker = tokio::time::interval(config.status_interval_duration());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {
                match serde_json::to_string(&access.status()) {
                    Ok(status) => info!(status = %status, "Status"),
                    Err(e) => error!(error = %e, "Failed to serialize status"),
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    config.validate()?;
    let primary = config.parse_primary()?;
    let replicas = config.parse_replicas()?;

    info!(
        primary = %mask_connection_string(&primary.connection_string),
        replicas = replicas.len(),
        read_strategy = %config.read_strategy,
        "Starting db-router v{}",
        env!("CARGO_PKG_VERSION")
    );

    let access = DataAccess::start(AccessOptions::from(&config), primary, replicas).await?;

    let result = match &config.execute {
        Some(sql) => match access.execute(sql, &[], ExecuteOptions::default()).await {
            Ok(outcome) => serde_json::to_string_pretty(&outcome)
                .map(|json| println!("{json}"))
                .map_err(|e| DbError::internal(format!("Failed to serialize result: {e}"))),
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Statement failed");
                Err(e)
            }
        },
        None => {
            run_daemon(&access, &config).await;
            Ok(())
        }
    };

    access.stop().await;
    info!("Shutdown complete");
    result.map_err(Into::into)
}
