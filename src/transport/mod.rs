//! Transport layer for the progress feed.
//!
//! This module exposes the monitor feed to external observers:
//! - HTTP: JSON endpoints for run status, tables, workers, logs and settings

pub mod http;

pub use http::HttpMonitor;

use crate::error::EtlResult;
use std::future::Future;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Trait for monitor transport implementations.
pub trait Transport: Send + Sync {
    /// Serve until `shutdown` fires.
    fn run(&self, shutdown: CancellationToken) -> impl Future<Output = EtlResult<()>> + Send;

    /// Get the name of this transport for logging.
    fn name(&self) -> &'static str;
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_signal() {
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
