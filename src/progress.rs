//! Live progress of the current run.
//!
//! The [`ProgressPublisher`] owns all run, table and worker state. Workers
//! receive [`TableTracker`] and [`WorkerTracker`] handles whose row counters
//! are atomics, so a worker never waits on a reader. Readers receive
//! immutable copies from [`ProgressPublisher::snapshot`] and friends.

use crate::models::{
    LogEntry, LogLevel, ProgressSnapshot, RowCountCheck, RunPhase, RunStatus, RunSummary,
    TablePhase, TableProgress, TableStatus, WorkerKind, WorkerState,
};
use crate::resolver::ResolvedNames;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Log entries kept for the progress feed.
pub const MAX_LOG_ENTRIES: usize = 100;

/// Characters of an error kept in a worker's status line.
pub const WORKER_ERROR_LIMIT: usize = 50;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn truncate_chars(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Shared container for the run summary, tables, workers and log stream.
#[derive(Debug, Clone, Default)]
pub struct ProgressPublisher {
    inner: Arc<PublisherInner>,
}

#[derive(Debug, Default)]
struct PublisherInner {
    summary: Mutex<RunSummary>,
    tables: RwLock<Vec<Arc<TableCell>>>,
    logs: Mutex<VecDeque<LogEntry>>,
}

impl ProgressPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset table state and mark a new run as started.
    pub fn begin_run(&self, run_id: impl Into<String>) {
        {
            let mut summary = lock(&self.inner.summary);
            *summary = RunSummary {
                status: RunStatus::Running,
                phase: RunPhase::ResolvingNames,
                run_id: Some(run_id.into()),
                started_at: Some(Utc::now()),
                ..RunSummary::default()
            };
        }
        self.inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn set_phase(&self, phase: RunPhase) {
        lock(&self.inner.summary).phase = phase;
        debug!(phase = %phase, "Run phase changed");
    }

    pub fn set_resolved(&self, names: ResolvedNames) {
        lock(&self.inner.summary).resolved = Some(names);
    }

    pub fn set_next_run(&self, next_run_time: Option<DateTime<Utc>>) {
        lock(&self.inner.summary).next_run_time = next_run_time;
    }

    /// Register a pending table and return its handle.
    pub fn register_table(&self, name: impl Into<String>) -> TableTracker {
        let cell = Arc::new(TableCell::new(name.into()));
        let mut tables = self
            .inner
            .tables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tables.push(Arc::clone(&cell));
        lock(&self.inner.summary).total_tables = tables.len();
        TableTracker {
            cell,
            publisher: self.clone(),
        }
    }

    /// Handle of a registered table.
    pub fn table(&self, name: &str) -> Option<TableTracker> {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|cell| cell.name == name)
            .map(|cell| TableTracker {
                cell: Arc::clone(cell),
                publisher: self.clone(),
            })
    }

    /// Close the current run and return its final summary.
    pub fn finish_run(&self, status: RunStatus, error: Option<String>) -> RunSummary {
        {
            let mut summary = lock(&self.inner.summary);
            summary.status = status;
            summary.phase = RunPhase::Idle;
            summary.finished_at = Some(Utc::now());
            summary.error = error;
        }
        self.summary()
    }

    /// Append to the log stream and emit the matching tracing event.
    pub fn event(&self, level: LogLevel, message: impl Into<String>, table: Option<&str>) {
        let message = message.into();
        let table_field = table.unwrap_or("-");
        match level {
            LogLevel::Debug => debug!(table = %table_field, "{}", message),
            LogLevel::Info => info!(table = %table_field, "{}", message),
            LogLevel::Warning => warn!(table = %table_field, "{}", message),
            LogLevel::Error => error!(table = %table_field, "{}", message),
        }

        let mut logs = lock(&self.inner.logs);
        if logs.len() >= MAX_LOG_ENTRIES {
            logs.pop_front();
        }
        logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
            table: table.map(String::from),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.event(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.event(LogLevel::Warning, message, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.event(LogLevel::Error, message, None);
    }

    /// Current summary, with table counts taken from the table list.
    pub fn summary(&self) -> RunSummary {
        let mut summary = lock(&self.inner.summary).clone();
        let tables = self.tables();
        summary.total_tables = tables.len();
        summary.completed_tables = tables
            .iter()
            .filter(|t| t.status == TableStatus::Completed)
            .count();
        summary.failed_tables = tables
            .iter()
            .filter(|t| t.status == TableStatus::Failed)
            .count();
        if let Some(started) = summary.started_at {
            let end = summary.finished_at.unwrap_or_else(Utc::now);
            summary.elapsed_seconds = (end - started).num_milliseconds().max(0) as f64 / 1000.0;
        }
        summary
    }

    pub fn tables(&self) -> Vec<TableProgress> {
        self.cells().iter().map(|cell| cell.progress()).collect()
    }

    /// Active workers keyed by table; tables without workers are omitted.
    pub fn workers(&self) -> BTreeMap<String, Vec<WorkerState>> {
        self.cells()
            .iter()
            .filter_map(|cell| {
                let workers = cell.worker_states();
                (!workers.is_empty()).then(|| (cell.name.clone(), workers))
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        lock(&self.inner.logs).iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            summary: self.summary(),
            tables: self.tables(),
            workers: self.workers(),
            logs: self.logs(),
        }
    }

    fn cells(&self) -> Vec<Arc<TableCell>> {
        self.inner
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug)]
struct TableCell {
    name: String,
    src_rows: AtomicU64,
    dst_rows: AtomicU64,
    detail: Mutex<TableDetail>,
    workers: Mutex<BTreeMap<String, Arc<WorkerCell>>>,
}

#[derive(Debug)]
struct TableDetail {
    status: TableStatus,
    phase: Option<TablePhase>,
    attempt: u32,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    verification: Option<RowCountCheck>,
}

impl TableCell {
    fn new(name: String) -> Self {
        Self {
            name,
            src_rows: AtomicU64::new(0),
            dst_rows: AtomicU64::new(0),
            detail: Mutex::new(TableDetail {
                status: TableStatus::Pending,
                phase: None,
                attempt: 0,
                error: None,
                started_at: None,
                finished_at: None,
                verification: None,
            }),
            workers: Mutex::new(BTreeMap::new()),
        }
    }

    fn progress(&self) -> TableProgress {
        let detail = lock(&self.detail);
        TableProgress {
            name: self.name.clone(),
            status: detail.status,
            phase: detail.phase,
            src_rows: self.src_rows.load(Ordering::Acquire),
            dst_rows: self.dst_rows.load(Ordering::Acquire),
            attempt: detail.attempt,
            error: detail.error.clone(),
            started_at: detail.started_at,
            finished_at: detail.finished_at,
            verification: detail.verification,
        }
    }

    fn worker_states(&self) -> Vec<WorkerState> {
        lock(&self.workers)
            .values()
            .map(|worker| worker.state())
            .collect()
    }
}

/// Handle to one table's progress.
#[derive(Debug, Clone)]
pub struct TableTracker {
    cell: Arc<TableCell>,
    publisher: ProgressPublisher,
}

impl TableTracker {
    pub fn name(&self) -> &str {
        &self.cell.name
    }

    pub fn status(&self) -> TableStatus {
        lock(&self.cell.detail).status
    }

    /// Mark the start of an attempt (1-based).
    pub fn begin_attempt(&self, attempt: u32) {
        let mut detail = lock(&self.cell.detail);
        detail.status = TableStatus::Processing;
        detail.phase = Some(TablePhase::Planning);
        detail.attempt = attempt;
        detail.error = None;
        detail.started_at.get_or_insert_with(Utc::now);
    }

    pub fn set_phase(&self, phase: TablePhase) {
        lock(&self.cell.detail).phase = Some(phase);
    }

    pub fn set_src_rows(&self, rows: u64) {
        self.cell.src_rows.store(rows, Ordering::Release);
    }

    pub fn src_rows(&self) -> u64 {
        self.cell.src_rows.load(Ordering::Acquire)
    }

    /// Count rows applied to the destination.
    pub fn add_dst_rows(&self, rows: u64) {
        self.cell.dst_rows.fetch_add(rows, Ordering::AcqRel);
    }

    pub fn dst_rows(&self) -> u64 {
        self.cell.dst_rows.load(Ordering::Acquire)
    }

    /// Mark the table as waiting for attempt `next_attempt` of `max_attempts`.
    pub fn mark_retrying(&self, next_attempt: u32, max_attempts: u32) {
        self.clear_workers();
        let mut detail = lock(&self.cell.detail);
        detail.status = TableStatus::Retrying;
        detail.error = Some(format!("Retry attempt {}/{}", next_attempt, max_attempts));
    }

    pub fn complete(&self, verification: Option<RowCountCheck>) {
        self.clear_workers();
        let mut detail = lock(&self.cell.detail);
        detail.status = TableStatus::Completed;
        detail.phase = Some(TablePhase::Completed);
        detail.error = None;
        detail.finished_at = Some(Utc::now());
        detail.verification = verification;
    }

    pub fn fail(&self, error: impl Into<String>, verification: Option<RowCountCheck>) {
        self.clear_workers();
        let mut detail = lock(&self.cell.detail);
        detail.status = TableStatus::Failed;
        detail.phase = Some(TablePhase::Failed);
        detail.error = Some(error.into());
        detail.finished_at = Some(Utc::now());
        if verification.is_some() {
            detail.verification = verification;
        }
    }

    /// Register a worker; ids are `producer-N` / `consumer-N`.
    pub fn worker(&self, kind: WorkerKind, index: usize, total_rows: u64) -> WorkerTracker {
        let id = format!("{}-{}", kind, index);
        let cell = Arc::new(WorkerCell {
            id: id.clone(),
            kind,
            rows_processed: AtomicU64::new(0),
            total_rows: AtomicU64::new(total_rows),
            status: Mutex::new("starting".to_string()),
        });
        lock(&self.cell.workers).insert(id, Arc::clone(&cell));
        WorkerTracker { cell }
    }

    /// Remove all worker entries of this table.
    pub fn clear_workers(&self) {
        lock(&self.cell.workers).clear();
    }

    pub fn info(&self, message: impl Into<String>) {
        self.publisher
            .event(LogLevel::Info, message, Some(&self.cell.name));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.publisher
            .event(LogLevel::Warning, message, Some(&self.cell.name));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publisher
            .event(LogLevel::Error, message, Some(&self.cell.name));
    }
}

#[derive(Debug)]
struct WorkerCell {
    id: String,
    kind: WorkerKind,
    rows_processed: AtomicU64,
    total_rows: AtomicU64,
    status: Mutex<String>,
}

impl WorkerCell {
    fn state(&self) -> WorkerState {
        WorkerState {
            worker_id: self.id.clone(),
            kind: self.kind,
            rows_processed: self.rows_processed.load(Ordering::Acquire),
            total_rows: self.total_rows.load(Ordering::Acquire),
            status: lock(&self.status).clone(),
        }
    }
}

/// Handle to one worker's progress.
#[derive(Debug, Clone)]
pub struct WorkerTracker {
    cell: Arc<WorkerCell>,
}

impl WorkerTracker {
    pub fn id(&self) -> &str {
        &self.cell.id
    }

    pub fn add_rows(&self, rows: u64) {
        self.cell.rows_processed.fetch_add(rows, Ordering::AcqRel);
    }

    pub fn rows_processed(&self) -> u64 {
        self.cell.rows_processed.load(Ordering::Acquire)
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *lock(&self.cell.status) = status.into();
    }

    /// Record a failure; only the start of the message is kept.
    pub fn fail(&self, error: &str) {
        self.set_status(format!("error: {}", truncate_chars(error, WORKER_ERROR_LIMIT)));
    }
}
