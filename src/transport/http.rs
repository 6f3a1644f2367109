//! HTTP monitor for the progress feed.
//!
//! Serves read-only JSON views of the publisher and the settings write-back
//! endpoint. There is no authentication; bind it to a trusted interface.

use crate::config::RunConfig;
use crate::error::{EtlError, EtlResult};
use crate::models::{LogEntry, ProgressSnapshot, RunSummary, TableProgress, WorkerState};
use crate::progress::ProgressPublisher;
use crate::settings::SettingsStore;
use crate::transport::Transport;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared state of the monitor handlers.
#[derive(Clone)]
pub struct MonitorState {
    pub publisher: ProgressPublisher,
    pub settings: Arc<SettingsStore>,
}

/// Build the monitor router.
pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/tables", get(tables))
        .route("/api/workers", get(workers))
        .route("/api/logs", get(logs))
        .route("/api/snapshot", get(snapshot))
        .route("/api/config", get(get_config).post(post_config))
        .with_state(state)
}

async fn status(State(state): State<MonitorState>) -> Json<RunSummary> {
    Json(state.publisher.summary())
}

async fn tables(State(state): State<MonitorState>) -> Json<Vec<TableProgress>> {
    Json(state.publisher.tables())
}

async fn workers(State(state): State<MonitorState>) -> Json<BTreeMap<String, Vec<WorkerState>>> {
    Json(state.publisher.workers())
}

async fn logs(State(state): State<MonitorState>) -> Json<Vec<LogEntry>> {
    Json(state.publisher.logs())
}

async fn snapshot(State(state): State<MonitorState>) -> Json<ProgressSnapshot> {
    Json(state.publisher.snapshot())
}

/// Current settings with passwords masked.
async fn get_config(State(state): State<MonitorState>) -> Response {
    let config = match state.settings.current() {
        Some(config) => Ok(config),
        None => state.settings.load(),
    };
    match config {
        Ok(config) => Json(config.masked()).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e),
    }
}

/// Validate and store settings for the next run.
async fn post_config(State(state): State<MonitorState>, Json(config): Json<RunConfig>) -> Response {
    match state.settings.submit(config) {
        Ok(()) => {
            state.publisher.info("Settings updated; they apply from the next run");
            (StatusCode::OK, Json(json!({ "status": "accepted" }))).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Rejected settings update");
            error_response(StatusCode::BAD_REQUEST, &e)
        }
    }
}

fn error_response(status: StatusCode, err: &EtlError) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// HTTP monitor transport.
pub struct HttpMonitor {
    state: MonitorState,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpMonitor {
    pub fn new(
        publisher: ProgressPublisher,
        settings: Arc<SettingsStore>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            state: MonitorState {
                publisher,
                settings,
            },
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Transport for HttpMonitor {
    async fn run(&self, shutdown: CancellationToken) -> EtlResult<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            EtlError::config(format!("Failed to bind monitor to {}: {}", bind_addr, e))
        })?;
        info!(addr = %bind_addr, "Monitor listening");

        let app = router(self.state.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| {
                error!(error = %e, "Monitor server error");
                EtlError::internal(format!("Monitor server error: {}", e))
            })?;

        info!("Monitor stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn state_with(settings: SettingsStore) -> MonitorState {
        MonitorState {
            publisher: ProgressPublisher::new(),
            settings: Arc::new(settings),
        }
    }

    fn valid_config() -> RunConfig {
        let map: HashMap<String, String> = [
            ("SRC_DB_URL", "sqlite:///tmp/etl-src"),
            ("SRC_DB_NAME", "src"),
            ("DST_DB_URL", "sqlite:///tmp/etl-dst"),
            ("DST_DB_NAME", "dst_{YYYY}{MM}{DD}"),
            ("SRC_DB_PASSWORD", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        RunConfig::from_map(&map).unwrap()
    }

    #[test]
    fn test_bind_addr() {
        let monitor = HttpMonitor::new(
            ProgressPublisher::new(),
            Arc::new(SettingsStore::new(None)),
            "0.0.0.0",
            5000,
        );
        assert_eq!(monitor.bind_addr(), "0.0.0.0:5000");
        assert_eq!(monitor.name(), "http");
    }

    #[tokio::test]
    async fn test_post_config_rejects_invalid_settings() {
        let state = state_with(SettingsStore::new(None));
        let mut config = valid_config();
        config.max_workers = 1;
        let response = post_config(State(state.clone()), Json(config)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.settings.current().is_none());
    }

    #[tokio::test]
    async fn test_post_then_get_config_masks_password() {
        let state = state_with(SettingsStore::new(None));
        let response = post_config(State(state.clone()), Json(valid_config())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let staged = state.settings.load().unwrap();
        assert_eq!(staged.source.password, "secret");

        let response = get_config(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reflects_publisher() {
        let state = state_with(SettingsStore::new(None));
        state.publisher.register_table("a");
        let Json(summary) = status(State(state.clone())).await;
        assert_eq!(summary.total_tables, 1);
        let Json(tables) = tables(State(state)).await;
        assert_eq!(tables[0].name, "a");
    }
}
