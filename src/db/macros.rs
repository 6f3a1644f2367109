//! Backend type and the dispatch macro over `DbPool` variants.
//!
//! The macro expands to a plain `match`, so each backend arm stays readable
//! while call sites avoid repeating the variant list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Database backend type for dispatch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    MySql,
    SQLite,
}

impl DatabaseType {
    /// Detect the backend from a URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Maximum number of bind parameters accepted in one statement.
    pub fn max_bind_params(self) -> usize {
        match self {
            Self::MySql => 65_535,
            Self::SQLite => 32_766,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MySql => write!(f, "mysql"),
            Self::SQLite => write!(f, "sqlite"),
        }
    }
}

/// Macro for generating database dispatch match arms.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => mysql::count_rows(p, table).await,
///     SQLite(p) => sqlite::count_rows(p, table).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
