//! Data models for the ETL engine.
//!
//! This module re-exports the table metadata and progress read models used
//! throughout the application.

pub mod progress;
pub mod schema;

// Re-export commonly used types
pub use progress::{
    LogEntry, LogLevel, ProgressSnapshot, RowCountCheck, RunPhase, RunStatus, RunSummary,
    TablePhase, TableProgress, TableStatus, WorkerKind, WorkerState,
};
pub use schema::{ColumnDefinition, KeyKind, TableInfo, TableKey, TableSchema};
