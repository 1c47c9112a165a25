//! Loading CSV files into tables.

use crate::config::IfExists;
use crate::sink::parse_csv;
use crate::types::Row;
use crate::{Error, Result};
use serde_json::Value;
use std::path::Path;

use super::{Affinity, Database};

impl Database {
    /// Load the CSV file at `path` into `table`, `chunk_size` rows per transaction
    ///
    /// The first record is the header. Cells are typed on the way in: empty cells become
    /// NULL, integers and finite floats become numbers, everything else stays text.
    /// Returns the number of rows loaded.
    pub async fn import_csv(
        &self,
        table: &str,
        path: &Path,
        if_exists: IfExists,
        chunk_size: usize,
    ) -> Result<u64> {
        let text = tokio::fs::read_to_string(path).await?;
        let mut records = parse_csv(text.trim_start_matches('\u{feff}')).into_iter();
        let header = records
            .next()
            .ok_or_else(|| Error::Other(format!("{} has no header row", path.display())))?;

        let rows: Vec<Row> = records
            .map(|record| {
                header
                    .iter()
                    .enumerate()
                    .map(|(index, name)| {
                        let cell = record.get(index).map(String::as_str).unwrap_or("");
                        (name.clone(), infer_value(cell))
                    })
                    .collect()
            })
            .collect();

        if if_exists == IfExists::Replace {
            self.drop_table(table).await?;
        }

        if rows.is_empty() {
            let columns: Vec<(String, Affinity)> = header
                .iter()
                .map(|name| (name.clone(), Affinity::Text))
                .collect();
            if !columns.is_empty() {
                self.ensure_columns(table, &columns).await?;
            }
            tracing::info!(table, path = %path.display(), "Imported empty CSV");
            return Ok(0);
        }

        let mut written = 0;
        for chunk in rows.chunks(chunk_size.max(1)) {
            written += self.append_rows(table, chunk).await?;
        }

        tracing::info!(table, path = %path.display(), rows = written, "Imported CSV");
        Ok(written)
    }
}

fn infer_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::from(int);
    }
    match cell.parse::<f64>() {
        Ok(float) if float.is_finite() => Value::from(float),
        _ => Value::from(cell),
    }
}
