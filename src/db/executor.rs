//! Row transfer execution.
//!
//! This module runs the statements built by [`crate::db::sql`]:
//! - Keyset page reads on the source
//! - Multi-row upserts inside one destination transaction
//! - Mirrored DDL on the destination
//!
//! # Architecture
//!
//! Values are bound through the backend-specific binders in
//! [`crate::db::types`]; each backend arm of the dispatch is otherwise the same.

use crate::db::pool::DbPool;
use crate::db::sql;
use crate::db::types::{DecodeRow, SqlRow, SqlValue, bind_mysql, bind_sqlite};
use crate::error::EtlResult;
use crate::models::TableSchema;
use sqlx::Executor;
use tracing::debug;

/// Cursor and optional inclusive upper bound for one page read.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageBinds<'a> {
    pub cursor: Option<&'a [SqlValue]>,
    pub upper_bound: Option<i64>,
}

/// Fetch one page with a statement built by [`sql::select_page`].
pub async fn fetch_page(
    pool: &DbPool,
    query_sql: &str,
    binds: PageBinds<'_>,
) -> EtlResult<Vec<SqlRow>> {
    impl_db_dispatch!(pool, {
        MySql(p) => {
            let mut query = sqlx::query(query_sql);
            for value in binds.cursor.unwrap_or_default() {
                query = bind_mysql(query, value);
            }
            if let Some(upper) = binds.upper_bound {
                query = query.bind(upper);
            }
            query
                .fetch_all(p)
                .await?
                .iter()
                .map(|row| row.decode_values())
                .collect()
        },
        SQLite(p) => {
            let mut query = sqlx::query(query_sql);
            for value in binds.cursor.unwrap_or_default() {
                query = bind_sqlite(query, value);
            }
            if let Some(upper) = binds.upper_bound {
                query = query.bind(upper);
            }
            query
                .fetch_all(p)
                .await?
                .iter()
                .map(|row| row.decode_values())
                .collect()
        },
    })
}

/// Upsert rows into `schema`'s table inside a single transaction.
///
/// Rows are split into statements that stay under the backend's bind limit;
/// either every statement commits or none does. Returns the rows applied.
pub async fn upsert_rows(pool: &DbPool, schema: &TableSchema, rows: &[SqlRow]) -> EtlResult<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let db = pool.db_type();
    let columns = schema.column_names();
    let per_statement = sql::rows_per_statement(db, columns.len());

    impl_db_dispatch!(pool, {
        MySql(p) => {
            let mut tx = p.begin().await?;
            for chunk in rows.chunks(per_statement) {
                let statement = sql::upsert(
                    db,
                    &schema.table_name,
                    &columns,
                    &schema.key.columns,
                    chunk.len(),
                );
                let mut query = sqlx::query(&statement);
                for value in chunk.iter().flatten() {
                    query = bind_mysql(query, value);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;
        },
        SQLite(p) => {
            let mut tx = p.begin().await?;
            for chunk in rows.chunks(per_statement) {
                let statement = sql::upsert(
                    db,
                    &schema.table_name,
                    &columns,
                    &schema.key.columns,
                    chunk.len(),
                );
                let mut query = sqlx::query(&statement);
                for value in chunk.iter().flatten() {
                    query = bind_sqlite(query, value);
                }
                query.execute(&mut *tx).await?;
            }
            tx.commit().await?;
        },
    });

    debug!(
        table = %schema.table_name,
        rows = rows.len(),
        statements = rows.len().div_ceil(per_statement),
        "Applied upsert batch"
    );
    Ok(rows.len() as u64)
}

/// Execute DDL statements in order, outside any transaction.
pub async fn execute_ddl(pool: &DbPool, statements: &[String]) -> EtlResult<()> {
    for statement in statements {
        impl_db_dispatch!(pool, {
            MySql(p) => { p.execute(statement.as_str()).await?; },
            SQLite(p) => { p.execute(statement.as_str()).await?; },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDefinition, TableKey};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> DbPool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        DbPool::SQLite(pool)
    }

    fn users_schema() -> TableSchema {
        TableSchema {
            table_name: "users".to_string(),
            columns: vec![
                ColumnDefinition::new("id", "INTEGER", false),
                ColumnDefinition::new("name", "TEXT", true),
            ],
            key: TableKey::primary(vec!["id".to_string()]),
            integer_key: true,
        }
    }

    fn user(id: i64, name: &str) -> SqlRow {
        vec![SqlValue::I64(id), SqlValue::String(name.to_string())]
    }

    #[tokio::test]
    async fn test_upsert_then_page_through() {
        let pool = memory_pool().await;
        execute_ddl(
            &pool,
            &["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)".to_string()],
        )
        .await
        .unwrap();

        let schema = users_schema();
        let rows: Vec<SqlRow> = (1..=5).map(|i| user(i, "a")).collect();
        assert_eq!(upsert_rows(&pool, &schema, &rows).await.unwrap(), 5);

        // Re-applying with new values overwrites instead of duplicating
        let rows: Vec<SqlRow> = (1..=5).map(|i| user(i, "b")).collect();
        upsert_rows(&pool, &schema, &rows).await.unwrap();

        let columns = schema.column_names();
        let first = sql::select_page(
            pool.db_type(),
            "users",
            &columns,
            &schema.key.columns,
            sql::PageShape {
                after_cursor: false,
                upper_bound: false,
                limit: 3,
            },
        );
        let page = fetch_page(&pool, &first, PageBinds::default()).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0], user(1, "b"));

        let next = sql::select_page(
            pool.db_type(),
            "users",
            &columns,
            &schema.key.columns,
            sql::PageShape {
                after_cursor: true,
                upper_bound: true,
                limit: 3,
            },
        );
        let cursor = vec![page[2][0].clone()];
        let page = fetch_page(
            &pool,
            &next,
            PageBinds {
                cursor: Some(&cursor),
                upper_bound: Some(4),
            },
        )
        .await
        .unwrap();
        assert_eq!(page, vec![user(4, "b")]);
    }

    #[tokio::test]
    async fn test_failed_upsert_rolls_back() {
        let pool = memory_pool().await;
        execute_ddl(
            &pool,
            &["CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)".to_string()],
        )
        .await
        .unwrap();

        let schema = users_schema();
        let rows = vec![user(1, "a"), vec![SqlValue::I64(2), SqlValue::Null]];
        assert!(upsert_rows(&pool, &schema, &rows).await.is_err());

        let DbPool::SQLite(p) = &pool else {
            unreachable!()
        };
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(p)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
