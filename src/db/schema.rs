//! Schema introspection module.
//!
//! # Architecture
//!
//! SQL queries are organized in the `queries` submodule with constants for each
//! database type. Database-specific implementations are in their respective
//! submodules (mysql, sqlite), each providing the same interface.

use crate::db::pool::DbPool;
use crate::db::sql;
use crate::db::types::{TypeCategory, categorize_type};
use crate::db::DatabaseType;
use crate::error::{EtlError, EtlResult};
use crate::models::{ColumnDefinition, TableInfo, TableKey, TableSchema};
use tracing::debug;

/// Schema inspector for database introspection.
pub struct SchemaInspector;

/// Integer key types whose whole value range fits the signed bounds query.
///
/// BIGINT UNSIGNED values above `i64::MAX` would wrap, so those keys are paged
/// by a single producer.
pub fn splittable_key_type(data_type: &str, db: DatabaseType) -> bool {
    let lower = data_type.to_ascii_lowercase();
    categorize_type(data_type, db) == TypeCategory::Integer
        && !(lower.contains("bigint") && lower.contains("unsigned"))
}

impl SchemaInspector {
    /// List base tables in the connected database.
    pub async fn list_tables(pool: &DbPool) -> EtlResult<Vec<TableInfo>> {
        impl_db_dispatch!(pool, {
            MySql(p) => mysql::list_tables(p).await,
            SQLite(p) => sqlite::list_tables(p).await,
        })
    }

    /// Describe columns and the pagination key of a table.
    ///
    /// The key is the primary key, or failing that the first unique index
    /// whose columns are all NOT NULL. Tables with neither fail.
    pub async fn describe_table(pool: &DbPool, table: &str) -> EtlResult<TableSchema> {
        let (columns, key) = impl_db_dispatch!(pool, {
            MySql(p) => mysql::describe_table(p, table).await?,
            SQLite(p) => sqlite::describe_table(p, table).await?,
        });

        if columns.is_empty() {
            return Err(EtlError::schema("Table not found", table));
        }
        let key = key.ok_or_else(|| {
            EtlError::schema(
                "Table has no primary key or NOT NULL unique key to page and upsert by",
                table,
            )
        })?;

        let integer_key = key.columns.len() == 1
            && columns
                .iter()
                .find(|c| c.name == key.columns[0])
                .is_some_and(|c| splittable_key_type(&c.data_type, pool.db_type()));

        Ok(TableSchema {
            table_name: table.to_string(),
            columns,
            key,
            integer_key,
        })
    }

    /// Check whether a table exists.
    pub async fn table_exists(pool: &DbPool, table: &str) -> EtlResult<bool> {
        impl_db_dispatch!(pool, {
            MySql(p) => mysql::table_exists(p, table).await,
            SQLite(p) => sqlite::table_exists(p, table).await,
        })
    }

    /// DDL statements that recreate a table (and its indexes) when absent.
    pub async fn create_table_statements(pool: &DbPool, table: &str) -> EtlResult<Vec<String>> {
        impl_db_dispatch!(pool, {
            MySql(p) => mysql::create_table_statements(p, table).await,
            SQLite(p) => sqlite::create_table_statements(p, table).await,
        })
    }

    /// Exact row count.
    pub async fn count_rows(pool: &DbPool, table: &str) -> EtlResult<u64> {
        let query = sql::count_rows(pool.db_type(), table);
        let count: i64 = impl_db_dispatch!(pool, {
            MySql(p) => sqlx::query_scalar(&query).fetch_one(p).await?,
            SQLite(p) => sqlx::query_scalar(&query).fetch_one(p).await?,
        });
        Ok(count.max(0) as u64)
    }

    /// MIN and MAX of an integer key column, or `None` for an empty table.
    pub async fn key_bounds(
        pool: &DbPool,
        table: &str,
        key: &str,
    ) -> EtlResult<Option<(i64, i64)>> {
        let query = sql::key_bounds(pool.db_type(), table, key);
        let bounds: (Option<i64>, Option<i64>) = impl_db_dispatch!(pool, {
            MySql(p) => sqlx::query_as(&query).fetch_one(p).await?,
            SQLite(p) => sqlx::query_as(&query).fetch_one(p).await?,
        });
        Ok(match bounds {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }
}

/// Insert `IF NOT EXISTS` after a leading `CREATE <kind>` clause.
pub(crate) fn add_if_not_exists(ddl: &str, kind: &str) -> String {
    let trimmed = ddl.trim_start();
    let prefix = format!("CREATE {} ", kind);
    let upper = trimmed.to_ascii_uppercase();
    if !upper.starts_with(&prefix)
        || upper[prefix.len()..]
            .trim_start()
            .starts_with("IF NOT EXISTS")
    {
        return trimmed.to_string();
    }
    format!("{}IF NOT EXISTS {}", &trimmed[..prefix.len()], &trimmed[prefix.len()..])
}

// =============================================================================
// SQL Query Templates
// =============================================================================

mod queries {
    pub mod mysql {
        pub const LIST_TABLES: &str = r#"
            SELECT
                CONVERT(TABLE_NAME USING utf8) AS TABLE_NAME,
                TABLE_ROWS as ROW_COUNT,
                CAST(COALESCE(DATA_LENGTH, 0) + COALESCE(INDEX_LENGTH, 0) AS UNSIGNED) as TOTAL_SIZE
            FROM information_schema.TABLES
            WHERE TABLE_SCHEMA = DATABASE()
            AND TABLE_TYPE = 'BASE TABLE'
            ORDER BY TABLE_NAME
            "#;

        pub const DESCRIBE_COLUMNS: &str = r#"
        SELECT
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME,
            CONVERT(COLUMN_TYPE USING utf8) AS COLUMN_TYPE,
            CONVERT(IS_NULLABLE USING utf8) AS IS_NULLABLE
        FROM information_schema.COLUMNS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        ORDER BY ORDINAL_POSITION
        "#;

        pub const DESCRIBE_UNIQUE_INDEXES: &str = r#"
        SELECT
            CONVERT(INDEX_NAME USING utf8) AS INDEX_NAME,
            CONVERT(COLUMN_NAME USING utf8) AS COLUMN_NAME
        FROM information_schema.STATISTICS
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        AND NON_UNIQUE = 0
        ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX
        "#;

        pub const TABLE_EXISTS: &str = r#"
        SELECT COUNT(*) FROM information_schema.TABLES
        WHERE TABLE_NAME = ? AND TABLE_SCHEMA = DATABASE()
        "#;
    }

    pub mod sqlite {
        pub const LIST_TABLES: &str = r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table'
            AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#;

        pub const TABLE_EXISTS: &str =
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?";

        pub const TABLE_DDL: &str =
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?";

        pub const INDEX_DDL: &str = r#"
            SELECT sql FROM sqlite_master
            WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL
            ORDER BY name
            "#;
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use sqlx::{MySqlPool, Row};

    /// Try to get a u64 value from a row, handling MySQL version differences.
    /// MySQL 5.x may return BIGINT (i64), MySQL 8.x returns BIGINT UNSIGNED (u64).
    fn try_get_u64(row: &sqlx::mysql::MySqlRow, column: &str) -> Option<u64> {
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(column) {
            return Some(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(column) {
            return Some(v as u64);
        }
        None
    }

    /// Safely get a string from a MySQL row.
    /// MySQL may return VARBINARY instead of VARCHAR depending on charset configuration.
    fn get_string(row: &sqlx::mysql::MySqlRow, column: &str) -> String {
        row.try_get::<String, _>(column)
            .ok()
            .or_else(|| {
                row.try_get::<Vec<u8>, _>(column)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            })
            .unwrap_or_default()
    }

    fn get_string_by_index(row: &sqlx::mysql::MySqlRow, index: usize) -> Option<String> {
        row.try_get::<String, _>(index).ok().or_else(|| {
            row.try_get::<Vec<u8>, _>(index)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub async fn list_tables(pool: &MySqlPool) -> EtlResult<Vec<TableInfo>> {
        let rows = sqlx::query(queries::mysql::LIST_TABLES)
            .fetch_all(pool)
            .await?;

        let tables = rows
            .iter()
            .filter_map(|row| {
                let name = get_string(row, "TABLE_NAME");
                if name.is_empty() {
                    return None;
                }
                let mut table = TableInfo::new(name);
                if let Some(count) = try_get_u64(row, "ROW_COUNT") {
                    table = table.with_estimated_rows(count);
                }
                if let Some(size) = try_get_u64(row, "TOTAL_SIZE") {
                    table = table.with_total_size(size);
                }
                Some(table)
            })
            .collect::<Vec<_>>();

        debug!(count = tables.len(), "Listed MySQL tables");
        Ok(tables)
    }

    pub async fn describe_table(
        pool: &MySqlPool,
        table: &str,
    ) -> EtlResult<(Vec<ColumnDefinition>, Option<TableKey>)> {
        let columns: Vec<ColumnDefinition> = sqlx::query(queries::mysql::DESCRIBE_COLUMNS)
            .bind(table)
            .fetch_all(pool)
            .await?
            .iter()
            .map(|row| {
                ColumnDefinition::new(
                    get_string(row, "COLUMN_NAME"),
                    get_string(row, "COLUMN_TYPE"),
                    get_string(row, "IS_NULLABLE") == "YES",
                )
            })
            .collect();

        let index_rows = sqlx::query(queries::mysql::DESCRIBE_UNIQUE_INDEXES)
            .bind(table)
            .fetch_all(pool)
            .await?;

        // Rows arrive grouped by index, PRIMARY first.
        let mut indexes: Vec<(String, Vec<String>)> = Vec::new();
        for row in &index_rows {
            let index = get_string(row, "INDEX_NAME");
            let column = get_string(row, "COLUMN_NAME");
            match indexes.last_mut() {
                Some((name, cols)) if *name == index => cols.push(column),
                _ => indexes.push((index, vec![column])),
            }
        }

        let key = indexes.into_iter().find_map(|(name, cols)| {
            if name == "PRIMARY" {
                return Some(TableKey::primary(cols));
            }
            let not_null = cols.iter().all(|k| {
                columns
                    .iter()
                    .any(|c| &c.name == k && !c.nullable)
            });
            not_null.then(|| TableKey::unique(name, cols))
        });

        Ok((columns, key))
    }

    pub async fn table_exists(pool: &MySqlPool, table: &str) -> EtlResult<bool> {
        let count: i64 = sqlx::query_scalar(queries::mysql::TABLE_EXISTS)
            .bind(table)
            .fetch_one(pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn create_table_statements(pool: &MySqlPool, table: &str) -> EtlResult<Vec<String>> {
        let query = format!(
            "SHOW CREATE TABLE {}",
            sql::quote_ident(DatabaseType::MySql, table)
        );
        let row = sqlx::query(&query).fetch_one(pool).await?;
        let ddl = get_string_by_index(&row, 1)
            .ok_or_else(|| EtlError::schema("SHOW CREATE TABLE returned no DDL", table))?;
        Ok(vec![add_if_not_exists(&ddl, "TABLE")])
    }
}

mod sqlite {
    use super::*;
    use sqlx::{Row, SqlitePool};

    pub async fn list_tables(pool: &SqlitePool) -> EtlResult<Vec<TableInfo>> {
        let rows = sqlx::query(queries::sqlite::LIST_TABLES)
            .fetch_all(pool)
            .await?;

        let tables = rows
            .iter()
            .map(|row| TableInfo::new(row.get::<String, _>("name")))
            .collect::<Vec<_>>();

        debug!(count = tables.len(), "Listed SQLite tables");
        Ok(tables)
    }

    pub async fn describe_table(
        pool: &SqlitePool,
        table: &str,
    ) -> EtlResult<(Vec<ColumnDefinition>, Option<TableKey>)> {
        let quoted = sql::quote_ident(DatabaseType::SQLite, table);
        let rows = sqlx::query(&format!("PRAGMA table_info({})", quoted))
            .fetch_all(pool)
            .await?;

        let mut pk: Vec<(i32, String)> = Vec::new();
        let columns: Vec<ColumnDefinition> = rows
            .iter()
            .map(|row| {
                let name: String = row.get("name");
                let data_type: String = row.get("type");
                let notnull: i32 = row.get("notnull");
                let pk_pos: i32 = row.get("pk");
                if pk_pos > 0 {
                    pk.push((pk_pos, name.clone()));
                }
                // PRIMARY KEY columns reject NULL in practice only for INTEGER
                // rowid aliases, but they are the paging key either way.
                ColumnDefinition::new(name, data_type, notnull == 0 && pk_pos == 0)
            })
            .collect();

        if !pk.is_empty() {
            pk.sort_by_key(|(pos, _)| *pos);
            let key = TableKey::primary(pk.into_iter().map(|(_, name)| name).collect());
            return Ok((columns, Some(key)));
        }

        let index_list = sqlx::query(&format!("PRAGMA index_list({})", quoted))
            .fetch_all(pool)
            .await?;
        let mut unique: Vec<String> = index_list
            .iter()
            .filter(|row| row.get::<i32, _>("unique") != 0)
            .map(|row| row.get::<String, _>("name"))
            .collect();
        unique.sort();

        for index in unique {
            let cols: Vec<String> = sqlx::query(&format!(
                "PRAGMA index_info({})",
                sql::quote_ident(DatabaseType::SQLite, &index)
            ))
            .fetch_all(pool)
            .await?
            .iter()
            .filter_map(|row| row.try_get::<Option<String>, _>("name").ok().flatten())
            .collect();

            let usable = !cols.is_empty()
                && cols
                    .iter()
                    .all(|k| columns.iter().any(|c| &c.name == k && !c.nullable));
            if usable {
                return Ok((columns, Some(TableKey::unique(index, cols))));
            }
        }

        Ok((columns, None))
    }

    pub async fn table_exists(pool: &SqlitePool, table: &str) -> EtlResult<bool> {
        let count: i64 = sqlx::query_scalar(queries::sqlite::TABLE_EXISTS)
            .bind(table)
            .fetch_one(pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn create_table_statements(pool: &SqlitePool, table: &str) -> EtlResult<Vec<String>> {
        let ddl: Option<String> = sqlx::query_scalar(queries::sqlite::TABLE_DDL)
            .bind(table)
            .fetch_optional(pool)
            .await?;
        let ddl = ddl.ok_or_else(|| EtlError::schema("Table not found", table))?;

        let mut statements = vec![add_if_not_exists(&ddl, "TABLE")];
        let indexes: Vec<String> = sqlx::query_scalar(queries::sqlite::INDEX_DDL)
            .bind(table)
            .fetch_all(pool)
            .await?;
        for index in indexes {
            let kind = if index.trim_start().to_ascii_uppercase().starts_with("CREATE UNIQUE") {
                "UNIQUE INDEX"
            } else {
                "INDEX"
            };
            statements.push(add_if_not_exists(&index, kind));
        }
        Ok(statements)
    }
}
