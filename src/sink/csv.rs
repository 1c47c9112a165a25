//! CSV output and parsing.

use crate::error::Error;
use crate::types::Row;
use crate::Result;
use std::collections::HashSet;
use std::io::{self, Write};
use std::mem::take;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{RowSink, render_cell};

/// Streams rows into one CSV file
///
/// The file is created fresh when the sink is opened. The header is taken from the keys
/// of the first row ever written and emitted exactly once; every later row is projected
/// onto it (absent keys become empty cells, keys outside the header are dropped with a
/// single warning).
pub struct CsvSink {
    path: PathBuf,
    label: String,
    state: Mutex<CsvState>,
}

struct CsvState {
    file: tokio::fs::File,
    header: Option<Header>,
    warned_extra: bool,
    rows: u64,
}

struct Header {
    columns: Vec<String>,
    known: HashSet<String>,
}

impl CsvSink {
    /// Create (or truncate) the file at `path`, creating parent directories
    pub async fn create(path: &Path) -> Result<Self> {
        let label = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::write(&label, e))?;
        }
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::write(&label, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            label,
            state: Mutex::new(CsvState {
                file,
                header: None,
                warned_extra: false,
                rows: 0,
            }),
        })
    }

    /// Path of the file being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header columns, once the first row has been written
    pub async fn header(&self) -> Option<Vec<String>> {
        self.state
            .lock()
            .await
            .header
            .as_ref()
            .map(|h| h.columns.clone())
    }

    /// Data rows written so far
    pub async fn rows_written(&self) -> u64 {
        self.state.lock().await.rows
    }
}

#[async_trait::async_trait]
impl RowSink for CsvSink {
    async fn write_rows(&self, rows: &[Row]) -> Result<u64> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };

        let mut state = self.state.lock().await;
        let mut buf: Vec<u8> = Vec::new();

        if state.header.is_none() {
            let columns: Vec<String> = first.keys().cloned().collect();
            write_record(&mut buf, &columns).map_err(|e| Error::write(&self.label, e))?;
            state.header = Some(Header {
                known: columns.iter().cloned().collect(),
                columns,
            });
        }

        let mut extra: Option<String> = None;
        if let Some(header) = &state.header {
            for row in rows {
                if extra.is_none() {
                    extra = row.keys().find(|k| !header.known.contains(*k)).cloned();
                }
                let cells: Vec<String> = header
                    .columns
                    .iter()
                    .map(|column| row.get(column).map(render_cell).unwrap_or_default())
                    .collect();
                write_record(&mut buf, &cells).map_err(|e| Error::write(&self.label, e))?;
            }
        }

        if let Some(field) = extra
            && !state.warned_extra
        {
            state.warned_extra = true;
            tracing::warn!(
                path = %self.label,
                field = %field,
                "Row has fields outside the CSV header; they are not written"
            );
        }

        state
            .file
            .write_all(&buf)
            .await
            .map_err(|e| Error::write(&self.label, e))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| Error::write(&self.label, e))?;

        state.rows += rows.len() as u64;
        Ok(rows.len() as u64)
    }

    async fn finish(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .file
            .sync_all()
            .await
            .map_err(|e| Error::write(&self.label, e))?;
        tracing::debug!(path = %self.label, rows = state.rows, "CSV file complete");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Write `rows` to a fresh CSV file in one go
pub async fn write_csv_file(path: &Path, rows: &[Row]) -> Result<u64> {
    let sink = CsvSink::create(path).await?;
    let written = sink.write_rows(rows).await?;
    sink.finish().await?;
    tracing::info!(path = %path.display(), rows = written, "Wrote CSV file");
    Ok(written)
}

fn needs_quotes(field: &str) -> bool {
    field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write one CSV record to any writer.
pub fn write_record<W: Write>(mut w: W, cells: &[String]) -> io::Result<()> {
    let mut first = true;
    for cell in cells {
        if !first {
            w.write_all(b",")?;
        } else {
            first = false;
        }
        if needs_quotes(cell) {
            write!(w, "\"{}\"", cell.replace('"', "\"\""))?;
        } else {
            w.write_all(cell.as_bytes())?;
        }
    }
    writeln!(w)
}

/// Minimal CSV parser (quotes + CRLF tolerant).
///
/// Blank lines are skipped.
pub fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut field = String::new();
    let mut record = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes {
                    if matches!(chars.peek(), Some('"')) {
                        chars.next(); // doubled quote
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                } else {
                    in_quotes = true;
                }
            }
            ',' if !in_quotes => record.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                record.push(take(&mut field));
                push_record(&mut records, take(&mut record));
            }
            _ => field.push(ch),
        }
    }

    // Trailing record without a final newline, even if quotes were left open
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }

    records
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if !(record.len() == 1 && record[0].is_empty()) {
        records.push(record);
    }
}
