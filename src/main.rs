//! DB ETL - Main entry point.
//!
//! Runs the table-copy schedule with settings from the env file, optionally
//! serving the progress feed over HTTP.

use clap::Parser;
use db_etl::config::Config;
use db_etl::transport::{HttpMonitor, Transport, wait_for_signal};
use db_etl::{Orchestrator, ProgressPublisher, Scheduler, SettingsStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
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

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    info!(
        env_file = %config.env_file.display(),
        once = config.once,
        "Starting DB ETL v{}",
        env!("CARGO_PKG_VERSION")
    );

    let settings = Arc::new(SettingsStore::new(Some(config.env_file.clone())));
    let publisher = ProgressPublisher::new();
    let orchestrator = Orchestrator::new(publisher.clone());

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("Shutting down, cancelling the current run");
            shutdown.cancel();
        });
    }

    let monitor = if config.monitor {
        let monitor = HttpMonitor::new(
            publisher.clone(),
            settings.clone(),
            config.monitor_host.clone(),
            config.monitor_port,
        );
        info!(addr = %config.monitor_bind_addr(), "Using {} monitor", monitor.name());
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = monitor.run(shutdown).await {
                error!(error = %e, "Monitor error");
            }
        }))
    } else {
        None
    };

    let code = Scheduler::new(orchestrator, settings)
        .run_once(config.once)
        .run(shutdown.clone())
        .await;

    shutdown.cancel();
    if let Some(handle) = monitor {
        if let Err(e) = handle.await {
            error!(error = %e, "Monitor task failed");
        }
    }

    info!(exit_code = code, "DB ETL finished");
    std::process::exit(code);
}
