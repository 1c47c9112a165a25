//! Destinations for harvested rows
//!
//! A [`RowSink`] receives batches of rows from concurrently finishing fetch tasks. Each
//! implementation serializes its own writes, so the rows of one `write_rows` call are
//! never interleaved with another's.
//!
//! - [`CsvSink`] appends to one CSV file whose header comes from the first row
//! - [`TableSink`] appends to a database table in fixed-size transactional chunks

use crate::Result;
use crate::types::Row;
use serde_json::Value;

mod csv;
mod table;

pub use csv::{CsvSink, parse_csv, write_csv_file, write_record};
pub use table::TableSink;

/// Receives result rows
#[async_trait::async_trait]
pub trait RowSink: Send + Sync {
    /// Append `rows`, returning how many were written
    async fn write_rows(&self, rows: &[Row]) -> Result<u64>;

    /// Flush anything buffered; the sink is not written to afterwards
    async fn finish(&self) -> Result<()>;

    /// Where the rows go (file path or table name), for logs and errors
    fn name(&self) -> &str;
}

/// Text form of one cell
///
/// Nulls become empty cells and nested values their compact JSON.
pub(crate) fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        nested => nested.to_string(),
    }
}
