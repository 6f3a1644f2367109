//! DB ETL Library
//!
//! This library copies every table of a source database into a destination
//! database in parallel, with dynamic database names, per-table retries and
//! deadlines, and a live progress feed (MySQL and SQLite).

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod progress;
pub mod resolver;
pub mod scheduler;
pub mod settings;
pub mod transport;

pub use config::{Config, RunConfig};
pub use error::EtlError;
pub use orchestrator::Orchestrator;
pub use progress::ProgressPublisher;
pub use scheduler::Scheduler;
pub use settings::SettingsStore;
