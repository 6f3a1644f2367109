//! Row values and type mappings.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders extract an owned [`SqlValue`]
//!
//! Values are carried between the source read and the destination write
//! without re-interpretation, so every variant binds back to the same
//! backend it was decoded from.

use crate::db::DatabaseType;
use crate::error::{EtlError, EtlResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlArguments, MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Decode, MySql, Row, Sqlite, Type, TypeInfo, ValueRef};

// =============================================================================
// Values
// =============================================================================

/// An owned column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    /// DECIMAL/NUMERIC in its exact textual form.
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One row, in table column order.
pub type SqlRow = Vec<SqlValue>;

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Date,
    Time,
    DateTime,
    Timestamp,
    Text,
    Binary,
    Json,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Decimal/Numeric - check first as it overlaps with "numeric" in float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC is actually a float
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Spatial names such as POINT would otherwise match "int"
    if ["geometry", "point", "linestring", "polygon"]
        .iter()
        .any(|spatial| lower.contains(spatial))
    {
        return TypeCategory::Binary;
    }

    if lower.contains("int") || lower.contains("serial") || lower == "year" {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower.starts_with("datetime") {
        return TypeCategory::DateTime;
    }
    if lower.starts_with("timestamp") {
        return TypeCategory::Timestamp;
    }
    if lower == "date" {
        return TypeCategory::Date;
    }
    if lower.starts_with("time") {
        return TypeCategory::Time;
    }

    if lower == "json" {
        return TypeCategory::Json;
    }

    if lower.contains("blob")
        || lower.contains("binary")
        || lower.starts_with("bit")
        || lower.contains("geometry")
    {
        return TypeCategory::Binary;
    }

    if lower.contains("char") || lower.contains("text") || lower == "enum" || lower == "set" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw DECIMAL/NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

// =============================================================================
// Row Decoding
// =============================================================================

/// Trait for converting driver rows into owned values.
pub trait DecodeRow {
    fn decode_values(&self) -> EtlResult<SqlRow>;
}

impl DecodeRow for MySqlRow {
    fn decode_values(&self) -> EtlResult<SqlRow> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| {
                let type_name = col.type_info().name();
                let category = categorize_type(type_name, DatabaseType::MySql);
                mysql::decode_column(self, idx, type_name, category).map_err(|e| {
                    EtlError::internal(format!(
                        "Failed to decode column '{}' ({}): {}",
                        col.name(),
                        type_name,
                        e
                    ))
                })
            })
            .collect()
    }
}

impl DecodeRow for SqliteRow {
    fn decode_values(&self) -> EtlResult<SqlRow> {
        (0..self.columns().len())
            .map(|idx| sqlite::decode_column(self, idx))
            .collect()
    }
}

// =============================================================================
// Parameter Binding
// =============================================================================

/// Bind a value to a MySQL query.
pub fn bind_mysql<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &'q SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::U64(v) => query.bind(*v),
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Decimal(v) | SqlValue::String(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

/// Bind a value to a SQLite query.
pub fn bind_sqlite<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::I64(v) => query.bind(*v),
        SqlValue::U64(v) => match i64::try_from(*v) {
            Ok(v) => query.bind(v),
            Err(_) => query.bind(v.to_string()),
        },
        SqlValue::F64(v) => query.bind(*v),
        SqlValue::Decimal(v) | SqlValue::String(v) => query.bind(v.as_str()),
        SqlValue::Bytes(v) => query.bind(v.as_slice()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::DateTime(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

/// Raw MySQL temporal bytes holding a zero date.
///
/// The binary protocol sends a zero date as a zero length prefix, the text
/// protocol as the literal `0000-00-00`.
fn is_zero_date_bytes(bytes: &[u8]) -> bool {
    bytes.first().is_none_or(|len| *len == 0) || bytes.starts_with(b"0000-00-00")
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Result<SqlValue, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(SqlValue::Null);
        }
        match category {
            TypeCategory::Decimal => Ok(SqlValue::Decimal(row.try_get::<RawDecimal, _>(idx)?.0)),
            // TINYINT(1) is reported as BOOLEAN but may hold any tinyint value
            TypeCategory::Integer | TypeCategory::Boolean => decode_integer(row, idx, type_name),
            TypeCategory::Float => decode_float(row, idx),
            TypeCategory::Date | TypeCategory::DateTime | TypeCategory::Timestamp
                if is_zero_date(row, idx) =>
            {
                Ok(SqlValue::Null)
            }
            TypeCategory::Date => Ok(SqlValue::Date(row.try_get(idx)?)),
            TypeCategory::Time => Ok(SqlValue::Time(row.try_get(idx)?)),
            TypeCategory::DateTime => Ok(SqlValue::DateTime(row.try_get(idx)?)),
            TypeCategory::Timestamp => decode_timestamp(row, idx),
            TypeCategory::Binary => Ok(SqlValue::Bytes(row.try_get(idx)?)),
            TypeCategory::Json => decode_json(row, idx),
            TypeCategory::Text | TypeCategory::Unknown => decode_text(row, idx),
        }
    }

    /// Zero dates (`0000-00-00`) have no chrono representation and load as NULL.
    fn is_zero_date(row: &MySqlRow, idx: usize) -> bool {
        row.try_get_unchecked::<&[u8], _>(idx)
            .is_ok_and(super::is_zero_date_bytes)
    }

    fn decode_integer(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
    ) -> Result<SqlValue, sqlx::Error> {
        if type_name.to_uppercase().contains("UNSIGNED") {
            if let Ok(v) = row.try_get::<u64, _>(idx) {
                return Ok(SqlValue::U64(v));
            }
        }
        if let Ok(v) = row.try_get::<i64, _>(idx) {
            return Ok(SqlValue::I64(v));
        }
        if let Ok(v) = row.try_get::<i32, _>(idx) {
            return Ok(SqlValue::I64(v.into()));
        }
        if let Ok(v) = row.try_get::<i16, _>(idx) {
            return Ok(SqlValue::I64(v.into()));
        }
        if let Ok(v) = row.try_get::<i8, _>(idx) {
            return Ok(SqlValue::I64(v.into()));
        }
        if let Ok(v) = row.try_get::<u32, _>(idx) {
            return Ok(SqlValue::U64(v.into()));
        }
        if let Ok(v) = row.try_get::<u16, _>(idx) {
            return Ok(SqlValue::U64(v.into()));
        }
        if let Ok(v) = row.try_get::<u8, _>(idx) {
            return Ok(SqlValue::U64(v.into()));
        }
        row.try_get::<u64, _>(idx).map(SqlValue::U64)
    }

    fn decode_float(row: &MySqlRow, idx: usize) -> Result<SqlValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<f64, _>(idx) {
            return Ok(SqlValue::F64(v));
        }
        row.try_get::<f32, _>(idx).map(|v| SqlValue::F64(v.into()))
    }

    fn decode_timestamp(row: &MySqlRow, idx: usize) -> Result<SqlValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<DateTime<Utc>, _>(idx) {
            return Ok(SqlValue::Timestamp(v));
        }
        row.try_get::<NaiveDateTime, _>(idx).map(SqlValue::DateTime)
    }

    fn decode_json(row: &MySqlRow, idx: usize) -> Result<SqlValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Ok(SqlValue::String(v));
        }
        row.try_get::<serde_json::Value, _>(idx)
            .map(|v| SqlValue::String(v.to_string()))
    }

    /// MySQL may return VARBINARY instead of VARCHAR depending on charset configuration.
    fn decode_text(row: &MySqlRow, idx: usize) -> Result<SqlValue, sqlx::Error> {
        if let Ok(v) = row.try_get::<String, _>(idx) {
            return Ok(SqlValue::String(v));
        }
        row.try_get::<Vec<u8>, _>(idx).map(SqlValue::Bytes)
    }
}

mod sqlite {
    use super::*;

    /// Storage class of a SQLite value, which may differ per row.
    enum Storage {
        Null,
        Integer,
        Real,
        Text,
        Blob,
    }

    fn storage_class(row: &SqliteRow, idx: usize) -> EtlResult<Storage> {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Storage::Null);
        }
        Ok(match raw.type_info().name() {
            "INTEGER" | "BOOLEAN" => Storage::Integer,
            "REAL" => Storage::Real,
            "BLOB" => Storage::Blob,
            _ => Storage::Text,
        })
    }

    pub fn decode_column(row: &SqliteRow, idx: usize) -> EtlResult<SqlValue> {
        Ok(match storage_class(row, idx)? {
            Storage::Null => SqlValue::Null,
            Storage::Integer => SqlValue::I64(row.try_get_unchecked(idx)?),
            Storage::Real => SqlValue::F64(row.try_get_unchecked(idx)?),
            Storage::Text => SqlValue::String(row.try_get_unchecked(idx)?),
            Storage::Blob => SqlValue::Bytes(row.try_get_unchecked(idx)?),
        })
    }
}
