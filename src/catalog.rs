//! Table discovery and filtering.
//!
//! The catalog lists the base tables of the resolved source database, applies
//! the include/exclude filters and attaches the row estimate the planner
//! sizes each table from.

use crate::config::RunConfig;
use crate::db::{DatabaseType, SchemaInspector, SourcePool};
use crate::error::EtlResult;
use crate::models::TableInfo;
use crate::resolver::glob_matches;
use tracing::{debug, info};

/// Format a byte count for logs (1024-based, KB/MB/GB units).
pub fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::WINDOWS)
}

/// Include/exclude filter over table names.
///
/// A non-empty include list keeps only the listed names and the exclude list
/// is ignored. Otherwise every table whose name starts with an excluded prefix
/// is dropped. Entries containing `*` are matched as globs in both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TableFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        Self { include, exclude }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.include_tables.clone(), config.exclude_tables.clone())
    }

    pub fn matches(&self, table: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|entry| {
                if entry.contains('*') {
                    glob_matches(entry, table)
                } else {
                    entry == table
                }
            });
        }
        !self.exclude.iter().any(|entry| {
            if entry.contains('*') {
                glob_matches(entry, table)
            } else {
                table.starts_with(entry.as_str())
            }
        })
    }

    /// Keep the tables that pass the filter, preserving order.
    pub fn apply(&self, tables: Vec<TableInfo>) -> Vec<TableInfo> {
        tables.into_iter().filter(|t| self.matches(&t.name)).collect()
    }
}

/// Source-side table discovery.
pub struct TableCatalog;

impl TableCatalog {
    /// List the source tables selected by `filter`, each with a row estimate.
    ///
    /// MySQL reports `TABLE_ROWS` from its statistics; SQLite has no such
    /// estimate, so its tables are counted exactly.
    pub async fn discover(source: &SourcePool, filter: &TableFilter) -> EtlResult<Vec<TableInfo>> {
        let pool = source.pool();
        let listed = SchemaInspector::list_tables(pool).await?;
        let listed_count = listed.len();
        let mut tables = filter.apply(listed);

        if pool.db_type() == DatabaseType::SQLite {
            for table in &mut tables {
                let rows = SchemaInspector::count_rows(pool, &table.name).await?;
                table.estimated_rows = Some(rows);
            }
        }

        for table in &tables {
            debug!(
                table = %table.name,
                estimated_rows = table.estimated_rows.unwrap_or(0),
                size = %table.total_size.map(format_size).unwrap_or_else(|| "-".to_string()),
                "Selected table"
            );
        }

        let total_bytes: u64 = tables.iter().filter_map(|t| t.total_size).sum();
        info!(
            listed = listed_count,
            selected = tables.len(),
            total_size = %format_size(total_bytes),
            "Cataloged source tables"
        );
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn tables(list: &[&str]) -> Vec<TableInfo> {
        list.iter().map(|n| TableInfo::new(*n)).collect()
    }

    fn selected(filter: &TableFilter, list: &[&str]) -> Vec<String> {
        filter
            .apply(tables(list))
            .into_iter()
            .map(|t| t.name)
            .collect()
    }

    #[test]
    fn test_include_keeps_exact_names_only() {
        let filter = TableFilter::new(names(&["tbl_user", "tbl_order"]), vec![]);
        assert_eq!(
            selected(&filter, &["tbl_user", "tbl_order", "tbl_log", "tbl_user_archive"]),
            vec!["tbl_user", "tbl_order"]
        );
    }

    #[test]
    fn test_include_wins_over_exclude() {
        let filter = TableFilter::new(names(&["tbl_user"]), names(&["tbl_"]));
        assert_eq!(selected(&filter, &["tbl_user", "tbl_log"]), vec!["tbl_user"]);
    }

    #[test]
    fn test_exclude_is_prefix_match() {
        let filter = TableFilter::new(vec![], names(&["tmp_", "log"]));
        assert_eq!(
            selected(&filter, &["tmp_a", "users", "logins", "blog"]),
            vec!["users", "blog"]
        );
    }

    #[test]
    fn test_wildcard_entries_match_as_globs() {
        let filter = TableFilter::new(vec![], names(&["*_bak"]));
        assert_eq!(
            selected(&filter, &["users_bak", "users", "bak_users"]),
            vec!["users", "bak_users"]
        );

        let filter = TableFilter::new(names(&["order*"]), vec![]);
        assert_eq!(
            selected(&filter, &["orders", "order_items", "users"]),
            vec!["orders", "order_items"]
        );
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        let filter = TableFilter::default();
        assert_eq!(selected(&filter, &["a", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1 kB");
    }
}
