//! Run orchestration.
//!
//! One run moves through `resolving_names → cataloging → loading →
//! summarizing`. Setup errors (configuration, name resolution, database or
//! pool creation, catalog) fail the whole run; everything after that is
//! scoped to a single table, so one failing table never stops its siblings.

use crate::catalog::{TableCatalog, TableFilter};
use crate::config::RunConfig;
use crate::db::executor;
use crate::db::pool::open_run_pools;
use crate::db::{RunPools, SchemaInspector, ServerConnector};
use crate::error::{EtlError, EtlResult};
use crate::models::{RowCountCheck, RunPhase, RunStatus, RunSummary, TableInfo, TablePhase};
use crate::pipeline::{self, RetryPolicy};
use crate::planner::{BatchPlanner, WorkerBudget, WorkerSlot};
use crate::progress::{ProgressPublisher, TableTracker};
use crate::resolver::{ResolvedNames, resolve_name};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Every table completed.
pub const EXIT_SUCCESS: i32 = 0;
/// Setup succeeded but at least one table failed.
pub const EXIT_TABLE_FAILURE: i32 = 1;
/// Configuration or setup failed before any table was loaded.
pub const EXIT_SETUP_FAILURE: i32 = 2;

/// Source of the current time, injected so name resolution is testable.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub summary: RunSummary,
    /// True when the run failed before loading started.
    pub setup_failed: bool,
    /// Highest number of simultaneously active workers.
    pub peak_workers: usize,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        if self.setup_failed {
            EXIT_SETUP_FAILURE
        } else if self.summary.failed_tables > 0 || self.summary.status == RunStatus::Failed {
            EXIT_TABLE_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }
}

/// Drives single runs and reports them through the publisher.
#[derive(Clone)]
pub struct Orchestrator {
    publisher: ProgressPublisher,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(publisher: ProgressPublisher) -> Self {
        Self {
            publisher,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock used for placeholder expansion.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn publisher(&self) -> &ProgressPublisher {
        &self.publisher
    }

    /// Execute one run with `config`.
    pub async fn run(&self, config: &RunConfig, cancel: &CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        self.publisher.begin_run(run_id.clone());
        self.publisher.info(format!("Run {} started", run_id));

        let budget = WorkerBudget::new(config.max_workers);
        let outcome = self.execute(config, &budget, cancel).await;

        let (summary, setup_failed) = match outcome {
            Ok(()) => {
                self.publisher.set_phase(RunPhase::Summarizing);
                let current = self.publisher.summary();
                let (status, error) = if cancel.is_cancelled() {
                    (RunStatus::Failed, Some("Run cancelled".to_string()))
                } else if current.total_tables > 0 && current.failed_tables == current.total_tables
                {
                    (
                        RunStatus::Failed,
                        Some(format!("All {} tables failed", current.total_tables)),
                    )
                } else {
                    (RunStatus::Completed, None)
                };
                (self.publisher.finish_run(status, error), false)
            }
            Err(err) => {
                let message = match err.suggestion() {
                    Some(hint) => format!("{} ({})", err, hint),
                    None => err.to_string(),
                };
                self.publisher.error(format!("Run setup failed: {}", message));
                (
                    self.publisher.finish_run(RunStatus::Failed, Some(err.to_string())),
                    true,
                )
            }
        };

        self.publisher.info(format!(
            "Run {} finished: {} completed, {} failed of {} tables in {:.1}s",
            run_id,
            summary.completed_tables,
            summary.failed_tables,
            summary.total_tables,
            summary.elapsed_seconds
        ));

        RunReport {
            summary,
            setup_failed,
            peak_workers: budget.peak_in_use(),
        }
    }

    async fn execute(
        &self,
        config: &RunConfig,
        budget: &WorkerBudget,
        cancel: &CancellationToken,
    ) -> EtlResult<()> {
        self.publisher.set_phase(RunPhase::ResolvingNames);
        // One connection per worker plus one for catalog and verification queries.
        let max_connections =
            u32::try_from(config.max_workers.saturating_add(1)).unwrap_or(u32::MAX);
        let source = ServerConnector::new(&config.source, &config.pool, max_connections)?;
        let destination =
            ServerConnector::new(&config.destination, &config.pool, max_connections)?;

        let now = (self.clock)();
        let names = ResolvedNames {
            source: resolve_name(&config.source.database, now, &source).await?,
            destination: resolve_name(&config.destination.database, now, &destination).await?,
        };
        self.publisher.info(format!(
            "Resolved databases: {} ({}) -> {} ({})",
            names.source,
            config.source.display_location(),
            names.destination,
            config.destination.display_location()
        ));
        self.publisher.set_resolved(names.clone());

        if config.dynamic_destination && destination.ensure_database(&names.destination).await? {
            self.publisher
                .info(format!("Created destination database {}", names.destination));
        }

        let pools = open_run_pools(&source, &names.source, &destination, &names.destination).await?;
        let guard = pools.clone().guard();
        let result = self.load(config, pools, budget, cancel).await;
        guard.close().await;
        result
    }

    async fn load(
        &self,
        config: &RunConfig,
        pools: RunPools,
        budget: &WorkerBudget,
        cancel: &CancellationToken,
    ) -> EtlResult<()> {
        self.publisher.set_phase(RunPhase::Cataloging);
        let filter = TableFilter::from_config(config);
        let tables = TableCatalog::discover(&pools.source, &filter).await?;
        if tables.is_empty() {
            self.publisher.warn("No tables selected for loading");
        } else {
            self.publisher
                .info(format!("Selected {} tables for loading", tables.len()));
        }

        self.publisher.set_phase(RunPhase::Loading);
        let ctx = Arc::new(TableContext {
            pools,
            planner: BatchPlanner::from_config(config),
            budget: budget.clone(),
            retry: config.retry,
            max_attempts: config.table_max_attempts.max(1),
            retry_delay: Duration::from_secs(config.table_retry_delay_seconds),
            deadline: config.table_deadline(),
        });

        let trackers: Vec<(TableInfo, TableTracker)> = tables
            .into_iter()
            .map(|info| {
                let tracker = self.publisher.register_table(info.name.clone());
                (info, tracker)
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (info, tracker) in trackers {
            tasks.spawn(process_table(
                Arc::clone(&ctx),
                info,
                tracker,
                cancel.child_token(),
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(join_err) = joined {
                self.publisher
                    .error(format!("Table task aborted: {}", join_err));
            }
        }
        Ok(())
    }
}

/// Shared state for the table tasks of one run.
struct TableContext {
    pools: RunPools,
    planner: BatchPlanner,
    budget: WorkerBudget,
    retry: RetryPolicy,
    max_attempts: u32,
    retry_delay: Duration,
    deadline: Option<Duration>,
}

/// Run one table to a terminal status, enforcing its deadline.
async fn process_table(
    ctx: Arc<TableContext>,
    info: TableInfo,
    tracker: TableTracker,
    token: CancellationToken,
) {
    // The deadline starts once the first attempt holds its worker slots.
    let result = match acquire_slots(&ctx, &info, &token).await {
        Ok(slots) => {
            let attempts = run_attempts(&ctx, &info, &tracker, &token, slots);
            with_deadline(ctx.deadline, &token, attempts)
                .await
                .unwrap_or_else(|| {
                    Err(EtlError::timeout(
                        format!("loading {}", info.name),
                        ctx.deadline.map(|d| d.as_secs()).unwrap_or_default(),
                    ))
                })
        }
        Err(err) => Err(err),
    };

    match result {
        Ok(check) if check.is_short() => {
            let message = format!(
                "Row count mismatch: source {}, destination {}",
                check.source, check.destination
            );
            tracker.error(message.clone());
            tracker.fail(message, Some(check));
        }
        Ok(check) => {
            if !check.matched {
                tracker.warn(format!(
                    "Destination holds {} more rows than the source",
                    check.difference
                ));
            }
            tracker.info(format!("Completed: {} rows", check.destination));
            tracker.complete(Some(check));
        }
        Err(err) => {
            tracker.error(format!("Failed: {}", err));
            tracker.fail(err.to_string(), None);
        }
    }
}

/// Drive `work` while a watchdog cancels `token` once `deadline` passes.
///
/// Returns `None` when the deadline fired, whatever `work` ended with.
async fn with_deadline<F, T>(
    deadline: Option<Duration>,
    token: &CancellationToken,
    work: F,
) -> Option<T>
where
    F: Future<Output = T>,
{
    let timed_out = Arc::new(AtomicBool::new(false));
    let watchdog = deadline.map(|limit| {
        let token = token.clone();
        let timed_out = Arc::clone(&timed_out);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    timed_out.store(true, Ordering::Release);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    });

    let output = work.await;
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    (!timed_out.load(Ordering::Acquire)).then_some(output)
}

/// Attempt a table until it succeeds, fails for good, or attempts run out.
///
/// `first_slots` are the worker slots of the first attempt; later attempts
/// reserve their own.
async fn run_attempts(
    ctx: &TableContext,
    info: &TableInfo,
    tracker: &TableTracker,
    token: &CancellationToken,
    first_slots: Vec<WorkerSlot>,
) -> EtlResult<RowCountCheck> {
    let mut attempt = 1;
    let mut pending = Some(first_slots);
    loop {
        let slots = match pending.take() {
            Some(slots) => slots,
            None => acquire_slots(ctx, info, token).await?,
        };
        tracker.begin_attempt(attempt);
        let err = match load_table(ctx, info, tracker, token, slots).await {
            Ok(check) => return Ok(check),
            Err(err) => err,
        };

        if !err.allows_table_reattempt() || attempt >= ctx.max_attempts || token.is_cancelled() {
            return Err(err);
        }

        tracker.warn(format!(
            "Attempt {}/{} failed: {}",
            attempt, ctx.max_attempts, err
        ));
        tracker.mark_retrying(attempt + 1, ctx.max_attempts);
        tokio::select! {
            _ = tokio::time::sleep(ctx.retry_delay) => {}
            _ = token.cancelled() => return Err(err),
        }
        attempt += 1;
    }
}

/// Reserve worker slots for one attempt, sized from the row estimate.
///
/// Slots are held before any table query so setup work stays within the
/// pool size.
async fn acquire_slots(
    ctx: &TableContext,
    info: &TableInfo,
    token: &CancellationToken,
) -> EtlResult<Vec<WorkerSlot>> {
    let wanted = ctx
        .planner
        .plan(info.estimated_rows.unwrap_or(0), true)
        .workers();
    ctx.budget.acquire(wanted, token).await
}

/// One attempt: plan, mirror DDL, copy, then compare row counts.
async fn load_table(
    ctx: &TableContext,
    info: &TableInfo,
    tracker: &TableTracker,
    token: &CancellationToken,
    mut slots: Vec<WorkerSlot>,
) -> EtlResult<RowCountCheck> {
    let source = ctx.pools.source.pool();
    let destination = ctx.pools.destination.pool();
    let table = info.name.as_str();

    tracker.set_phase(TablePhase::Planning);

    let schema = Arc::new(SchemaInspector::describe_table(source, table).await?);
    ensure_destination_table(&ctx.pools, table, tracker).await?;

    let src_rows = SchemaInspector::count_rows(source, table).await?;
    tracker.set_src_rows(src_rows);

    let plan = ctx
        .planner
        .plan(info.estimated_rows.unwrap_or(src_rows), schema.integer_key)
        .fit(slots.len());
    slots.truncate(plan.workers());

    tracker.set_phase(TablePhase::ExtractingLoading);
    tracker.info(format!(
        "Loading {} rows: {} producers, {} consumers, chunk {}, batch {}",
        src_rows, plan.num_producers, plan.num_consumers, plan.chunk_size, plan.batch_size
    ));
    pipeline::run_table(&ctx.pools, schema, plan, slots, ctx.retry, tracker, token).await?;

    tracker.set_phase(TablePhase::Verifying);
    let dst_rows = SchemaInspector::count_rows(destination, table).await?;
    let check = RowCountCheck::new(src_rows, dst_rows);
    info!(
        table = %table,
        source = check.source,
        destination = check.destination,
        matched = check.matched,
        "Verified row counts"
    );
    Ok(check)
}

/// Create the destination table from the source definition if it is missing.
async fn ensure_destination_table(
    pools: &RunPools,
    table: &str,
    tracker: &TableTracker,
) -> EtlResult<()> {
    let destination = pools.destination.pool();
    if SchemaInspector::table_exists(destination, table).await? {
        return Ok(());
    }
    let statements = SchemaInspector::create_table_statements(pools.source.pool(), table).await?;
    if statements.is_empty() {
        return Err(EtlError::schema("No source definition to mirror", table));
    }
    executor::execute_ddl(destination, &statements).await?;
    warn!(table = %table, statements = statements.len(), "Destination table was missing");
    tracker.info("Created destination table from the source definition");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus, failed: usize, setup_failed: bool) -> RunReport {
        RunReport {
            summary: RunSummary {
                status,
                total_tables: 3,
                completed_tables: 3 - failed,
                failed_tables: failed,
                ..RunSummary::default()
            },
            setup_failed,
            peak_workers: 0,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(report(RunStatus::Completed, 0, false).exit_code(), EXIT_SUCCESS);
        assert_eq!(report(RunStatus::Completed, 1, false).exit_code(), EXIT_TABLE_FAILURE);
        assert_eq!(report(RunStatus::Failed, 3, false).exit_code(), EXIT_TABLE_FAILURE);
        assert_eq!(report(RunStatus::Failed, 0, true).exit_code(), EXIT_SETUP_FAILURE);
    }

    #[tokio::test]
    async fn test_deadline_cancels_slow_work() {
        let token = CancellationToken::new();
        let work = {
            let token = token.clone();
            async move {
                token.cancelled().await;
                "stopped"
            }
        };
        let output = with_deadline(Some(Duration::from_millis(20)), &token, work).await;
        assert_eq!(output, None);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_passes_fast_work_through() {
        let token = CancellationToken::new();
        let output = with_deadline(Some(Duration::from_secs(60)), &token, async { 7 }).await;
        assert_eq!(output, Some(7));
        assert!(!token.is_cancelled());

        let output = with_deadline(None, &token, async { 8 }).await;
        assert_eq!(output, Some(8));
    }

    #[tokio::test]
    async fn test_outside_cancel_is_not_a_timeout() {
        let token = CancellationToken::new();
        token.cancel();
        let output = with_deadline(Some(Duration::from_secs(60)), &token, async { 1 }).await;
        assert_eq!(output, Some(1));
    }
}
