//! Database layer for qualer-dl
//!
//! Handles SQLite persistence of harvested rows. Tables are not declared up front: they
//! are created from the first chunk written to them and widened when later rows carry new
//! fields.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by concern:
//! - [`connection`] - Opening and closing the pool
//! - [`tables`] - Dynamic table creation, chunked appends, reads
//! - [`maintenance`] - Post-load deduplication and foreign keys, reference id columns
//! - [`import`] - Loading CSV files into tables

use crate::error::DatabaseError;
use crate::{Error, Result};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;

mod connection;
mod import;
mod maintenance;
mod tables;

/// SQLite column affinity inferred from JSON values
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// Integers and booleans
    Integer,
    /// Floating point numbers
    Real,
    /// Strings, and nested arrays/objects stored as JSON text
    Text,
}

impl Affinity {
    /// Affinity for a non-null value; `None` for `null`
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(Affinity::Integer),
            Value::Number(n) if n.is_i64() || n.is_u64() => Some(Affinity::Integer),
            Value::Number(_) => Some(Affinity::Real),
            Value::String(_) | Value::Array(_) | Value::Object(_) => Some(Affinity::Text),
        }
    }

    /// Type name used in `CREATE TABLE` / `ADD COLUMN`
    pub fn sql_type(self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Real => "REAL",
            Affinity::Text => "TEXT",
        }
    }
}

/// Column of an existing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Declared type (may be empty)
    pub declared_type: String,
}

/// Database handle for qualer-dl
pub struct Database {
    pool: SqlitePool,
    /// Serializes CREATE / ALTER so concurrent chunk appends agree on the schema
    schema_lock: tokio::sync::Mutex<()>,
}

/// Quote an identifier for interpolation into SQL
///
/// Table and column names come from configuration and upstream field names, so they can
/// never be bound as parameters.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty() || name.contains('\0') {
        return Err(Error::Database(DatabaseError::InvalidIdentifier(
            name.to_string(),
        )));
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

fn query_failed(context: &str, e: sqlx::Error) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
