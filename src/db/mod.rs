//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pools for the source and destination sides of a run
//! - Schema introspection and DDL mirroring
//! - Row values and type mappings
//! - SQL builders for keyset pages and upserts
//! - Page reads and transactional upserts
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod executor;
pub mod pool;
pub mod schema;
pub mod sql;
pub mod types;

pub use macros::DatabaseType;
pub use pool::{
    DatabaseTarget, DbPool, DestinationPool, PoolRole, RunPools, RunPoolsGuard, ServerConnector,
    SourcePool,
};
pub use schema::SchemaInspector;
pub use types::{SqlRow, SqlValue};
