//! SQL text builders for paging and upserts.
//!
//! Identifiers are always quoted; values are always bound. Page sizes are the
//! only numbers formatted into statement text.

use crate::db::DatabaseType;

/// Quote an identifier for the given backend.
pub fn quote_ident(db: DatabaseType, name: &str) -> String {
    match db {
        DatabaseType::MySql => format!("`{}`", name.replace('`', "``")),
        DatabaseType::SQLite => format!("\"{}\"", name.replace('"', "\"\"")),
    }
}

fn column_list(db: DatabaseType, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(db, c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Shape of a keyset page query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageShape {
    /// Bind the last key seen and only return rows after it.
    pub after_cursor: bool,
    /// Bind an inclusive upper bound on a single-column key.
    pub upper_bound: bool,
    pub limit: usize,
}

/// Build a keyset page query: `SELECT .. WHERE (k..) > (?..) ORDER BY k.. LIMIT n`.
///
/// Bind order is the cursor values (one per key column) followed by the
/// upper bound.
pub fn select_page(
    db: DatabaseType,
    table: &str,
    columns: &[String],
    key: &[String],
    shape: PageShape,
) -> String {
    let mut predicates = Vec::new();
    if shape.after_cursor {
        if key.len() == 1 {
            predicates.push(format!("{} > ?", quote_ident(db, &key[0])));
        } else {
            predicates.push(format!(
                "({}) > ({})",
                column_list(db, key),
                placeholders(key.len())
            ));
        }
    }
    if shape.upper_bound {
        if let Some(first) = key.first() {
            predicates.push(format!("{} <= ?", quote_ident(db, first)));
        }
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    format!(
        "SELECT {} FROM {}{} ORDER BY {} LIMIT {}",
        column_list(db, columns),
        quote_ident(db, table),
        where_clause,
        column_list(db, key),
        shape.limit.max(1)
    )
}

/// Build a multi-row upsert keyed on `key`.
///
/// Rows that already exist have every non-key column overwritten, so
/// applying the same rows again leaves the destination unchanged.
pub fn upsert(
    db: DatabaseType,
    table: &str,
    columns: &[String],
    key: &[String],
    row_count: usize,
) -> String {
    let row = format!("({})", placeholders(columns.len()));
    let values = vec![row.as_str(); row_count.max(1)].join(", ");
    let insert = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(db, table),
        column_list(db, columns),
        values
    );

    let updatable: Vec<&String> = columns.iter().filter(|c| !key.contains(c)).collect();

    match db {
        DatabaseType::MySql => {
            let assignments = if updatable.is_empty() {
                // Key-only table: a no-op assignment keeps duplicates silent
                let k = quote_ident(db, &key[0]);
                format!("{} = {}", k, k)
            } else {
                updatable
                    .iter()
                    .map(|c| {
                        let c = quote_ident(db, c);
                        format!("{} = VALUES({})", c, c)
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("{} ON DUPLICATE KEY UPDATE {}", insert, assignments)
        }
        DatabaseType::SQLite => {
            let target = column_list(db, key);
            if updatable.is_empty() {
                format!("{} ON CONFLICT ({}) DO NOTHING", insert, target)
            } else {
                let assignments = updatable
                    .iter()
                    .map(|c| {
                        let c = quote_ident(db, c);
                        format!("{} = excluded.{}", c, c)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{} ON CONFLICT ({}) DO UPDATE SET {}", insert, target, assignments)
            }
        }
    }
}

/// Rows per upsert statement that stay under the backend's bind limit.
pub fn rows_per_statement(db: DatabaseType, column_count: usize) -> usize {
    (db.max_bind_params() / column_count.max(1)).max(1)
}

pub fn count_rows(db: DatabaseType, table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", quote_ident(db, table))
}

/// MIN/MAX of an integer key, cast so both backends return a signed 64-bit value.
pub fn key_bounds(db: DatabaseType, table: &str, key: &str) -> String {
    let k = quote_ident(db, key);
    let signed = match db {
        DatabaseType::MySql => "SIGNED",
        DatabaseType::SQLite => "INTEGER",
    };
    format!(
        "SELECT CAST(MIN({k}) AS {signed}), CAST(MAX({k}) AS {signed}) FROM {}",
        quote_ident(db, table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident(DatabaseType::MySql, "a`b"), "`a``b`");
        assert_eq!(quote_ident(DatabaseType::SQLite, "a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_first_page_has_no_predicate() {
        let sql = select_page(
            DatabaseType::MySql,
            "users",
            &cols(&["id", "name"]),
            &cols(&["id"]),
            PageShape {
                after_cursor: false,
                upper_bound: false,
                limit: 1000,
            },
        );
        assert_eq!(
            sql,
            "SELECT `id`, `name` FROM `users` ORDER BY `id` LIMIT 1000"
        );
    }

    #[test]
    fn test_composite_cursor_uses_row_comparison() {
        let sql = select_page(
            DatabaseType::SQLite,
            "t",
            &cols(&["a", "b", "v"]),
            &cols(&["a", "b"]),
            PageShape {
                after_cursor: true,
                upper_bound: false,
                limit: 10,
            },
        );
        assert_eq!(
            sql,
            "SELECT \"a\", \"b\", \"v\" FROM \"t\" WHERE (\"a\", \"b\") > (?, ?) ORDER BY \"a\", \"b\" LIMIT 10"
        );
    }

    #[test]
    fn test_range_page_binds_cursor_then_upper() {
        let sql = select_page(
            DatabaseType::MySql,
            "t",
            &cols(&["id"]),
            &cols(&["id"]),
            PageShape {
                after_cursor: true,
                upper_bound: true,
                limit: 5,
            },
        );
        assert!(sql.contains("WHERE `id` > ? AND `id` <= ?"));
    }

    #[test]
    fn test_mysql_upsert() {
        let sql = upsert(
            DatabaseType::MySql,
            "users",
            &cols(&["id", "name"]),
            &cols(&["id"]),
            2,
        );
        assert_eq!(
            sql,
            "INSERT INTO `users` (`id`, `name`) VALUES (?, ?), (?, ?) ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn test_sqlite_upsert_key_only_table() {
        let sql = upsert(
            DatabaseType::SQLite,
            "tags",
            &cols(&["a", "b"]),
            &cols(&["a", "b"]),
            1,
        );
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO NOTHING"));

        let sql = upsert(
            DatabaseType::MySql,
            "tags",
            &cols(&["a", "b"]),
            &cols(&["a", "b"]),
            1,
        );
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `a` = `a`"));
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        assert_eq!(rows_per_statement(DatabaseType::SQLite, 10), 3_276);
        assert_eq!(rows_per_statement(DatabaseType::MySql, 100_000), 1);
        assert_eq!(rows_per_statement(DatabaseType::MySql, 0), 65_535);
    }
}
