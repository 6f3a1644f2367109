//! Run scheduling.
//!
//! With `ETL_INTERVAL_SECONDS=0` (or `--once`) a single run is executed and
//! its exit code returned. Otherwise runs repeat forever: settings are
//! reloaded before each run, a failed run never stops the loop, and a
//! shutdown signal cancels the current run and ends the loop.

use crate::orchestrator::{EXIT_SETUP_FAILURE, EXIT_SUCCESS, Orchestrator};
use crate::settings::SettingsStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Wait before retrying when settings cannot be loaded in loop mode.
pub const SETTINGS_RETRY_INTERVAL: Duration = Duration::from_secs(60);

pub struct Scheduler {
    orchestrator: Orchestrator,
    settings: Arc<SettingsStore>,
    run_once: bool,
}

impl Scheduler {
    pub fn new(orchestrator: Orchestrator, settings: Arc<SettingsStore>) -> Self {
        Self {
            orchestrator,
            settings,
            run_once: false,
        }
    }

    /// Force a single run regardless of the configured interval.
    pub fn run_once(mut self, once: bool) -> Self {
        self.run_once = once;
        self
    }

    /// Run until done (run-once mode) or until `shutdown` fires.
    ///
    /// Returns the process exit code.
    pub async fn run(&self, shutdown: CancellationToken) -> i32 {
        let publisher = self.orchestrator.publisher().clone();
        let mut last_interval: Option<Duration> = None;

        loop {
            let config = match self.settings.load() {
                Ok(config) => config,
                Err(e) => {
                    publisher.error(format!("Invalid settings: {}", e));
                    // Without a previous run the interval is unknown, so this is fatal.
                    let Some(interval) = last_interval.filter(|_| !self.run_once) else {
                        return EXIT_SETUP_FAILURE;
                    };
                    if !sleep_or_shutdown(interval.min(SETTINGS_RETRY_INTERVAL), &shutdown).await {
                        return EXIT_SUCCESS;
                    }
                    continue;
                }
            };

            publisher.set_next_run(None);
            let report = self.orchestrator.run(&config, &shutdown.child_token()).await;

            let interval = match config.interval() {
                Some(interval) if !self.run_once => interval,
                _ => return report.exit_code(),
            };
            if shutdown.is_cancelled() {
                info!("Shutdown requested, leaving the schedule");
                return report.exit_code();
            }
            last_interval = Some(interval);

            let next_run = Utc::now()
                + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
            publisher.set_next_run(Some(next_run));
            publisher.info(format!(
                "Next run at {} (in {}s)",
                next_run.format("%Y-%m-%d %H:%M:%S UTC"),
                interval.as_secs()
            ));

            if !sleep_or_shutdown(interval, &shutdown).await {
                info!("Shutdown requested, leaving the schedule");
                return EXIT_SUCCESS;
            }
        }
    }
}

/// Sleep for `duration`; false when shutdown fired first.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_or_shutdown() {
        let token = CancellationToken::new();
        assert!(sleep_or_shutdown(Duration::from_millis(1), &token).await);
        token.cancel();
        assert!(!sleep_or_shutdown(Duration::from_secs(60), &token).await);
    }
}
