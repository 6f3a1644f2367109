//! Progress read models.
//!
//! These are the immutable copies handed to readers of the progress feed.
//! The live, atomically updated state lives in [`crate::progress`].

use crate::resolver::ResolvedNames;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of one table within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Pending,
    Processing,
    Retrying,
    Completed,
    Failed,
}

impl TableStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Step a table is in while it is being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TablePhase {
    Planning,
    ExtractingLoading,
    Verifying,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Step the orchestrator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    ResolvingNames,
    Cataloging,
    Loading,
    Summarizing,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ResolvingNames => "resolving_names",
            Self::Cataloging => "cataloging",
            Self::Loading => "loading",
            Self::Summarizing => "summarizing",
        };
        f.write_str(name)
    }
}

/// Source and destination row counts compared after a table load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCountCheck {
    pub source: u64,
    pub destination: u64,
    /// `destination - source`
    pub difference: i64,
    pub matched: bool,
}

impl RowCountCheck {
    pub fn new(source: u64, destination: u64) -> Self {
        Self {
            source,
            destination,
            difference: destination as i64 - source as i64,
            matched: source == destination,
        }
    }

    /// True when the destination is missing rows.
    pub fn is_short(&self) -> bool {
        self.destination < self.source
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    pub name: String,
    pub status: TableStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<TablePhase>,
    pub src_rows: u64,
    pub dst_rows: u64,
    /// Attempt number, starting at 1 once processing begins.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<RowCountCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Producer,
    Consumer,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer => f.write_str("producer"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

/// One producer or consumer of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub kind: WorkerKind,
    pub rows_processed: u64,
    /// Rows this worker is expected to handle, 0 when unknown.
    pub total_rows: u64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub phase: RunPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: f64,
    pub total_tables: usize,
    pub completed_tables: usize,
    pub failed_tables: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedNames>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            status: RunStatus::Idle,
            phase: RunPhase::Idle,
            run_id: None,
            started_at: None,
            finished_at: None,
            elapsed_seconds: 0.0,
            total_tables: 0,
            completed_tables: 0,
            failed_tables: 0,
            next_run_time: None,
            resolved: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Everything the progress feed exposes, copied at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub summary: RunSummary,
    pub tables: Vec<TableProgress>,
    /// Workers keyed by table name.
    pub workers: BTreeMap<String, Vec<WorkerState>>,
    pub logs: Vec<LogEntry>,
}
