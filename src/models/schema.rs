//! Schema-related data models.
//!
//! This module defines the table metadata the catalog and pipeline work from.

use serde::{Deserialize, Serialize};

/// A table discovered in the source database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    /// Row estimate from the catalog; exact counts are taken separately.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_rows: Option<u64>,
    /// Bytes (data + indexes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_size: Option<u64>,
}

impl TableInfo {
    /// Create a new table info.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            estimated_rows: None,
            total_size: None,
        }
    }

    /// Set the estimated row count.
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Set the total size in bytes.
    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Declared type as reported by the server, e.g. `int(10) unsigned`.
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Origin of the key used for pagination and upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Primary,
    Unique,
}

/// Ordered key columns that identify a row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableKey {
    pub kind: KeyKind,
    /// Index name (`PRIMARY` for MySQL primary keys).
    pub name: String,
    pub columns: Vec<String>,
}

impl TableKey {
    pub fn primary(columns: Vec<String>) -> Self {
        Self {
            kind: KeyKind::Primary,
            name: "PRIMARY".to_string(),
            columns,
        }
    }

    pub fn unique(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            kind: KeyKind::Unique,
            name: name.into(),
            columns,
        }
    }
}

/// Columns and key of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnDefinition>,
    pub key: TableKey,
    /// True when the key is a single integer column, so its value range can
    /// be split between producers.
    pub integer_key: bool,
}

impl TableSchema {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Positions of the key columns within [`Self::columns`].
    pub fn key_positions(&self) -> Vec<usize> {
        self.key
            .columns
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }

    /// True when every column is part of the key.
    pub fn key_covers_all_columns(&self) -> bool {
        self.columns
            .iter()
            .all(|c| self.key.columns.contains(&c.name))
    }
}
