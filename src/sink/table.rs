//! Database table output.

use crate::config::IfExists;
use crate::db::Database;
use crate::error::Error;
use crate::types::Row;
use crate::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::RowSink;

/// Appends rows to one table in transactions of at most `chunk_size` rows
///
/// With [`IfExists::Replace`] the table is dropped once when the sink is opened, so a run
/// is a full reload; [`IfExists::Append`] keeps whatever is already there.
pub struct TableSink {
    db: Arc<Database>,
    table: String,
    chunk_size: usize,
    chunks: AtomicU64,
    rows: AtomicU64,
}

impl TableSink {
    /// Open a sink on `table`
    pub async fn open(
        db: Arc<Database>,
        table: &str,
        if_exists: IfExists,
        chunk_size: usize,
    ) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config {
                message: "chunk_size must be positive".into(),
                key: Some("output.chunk_size".into()),
            });
        }
        if if_exists == IfExists::Replace {
            db.drop_table(table).await?;
        }
        tracing::debug!(table, ?if_exists, chunk_size, "Opened table sink");

        Ok(Self {
            db,
            table: table.to_string(),
            chunk_size,
            chunks: AtomicU64::new(0),
            rows: AtomicU64::new(0),
        })
    }

    /// Transactions committed so far
    pub fn chunks_written(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    /// Rows committed so far
    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl RowSink for TableSink {
    async fn write_rows(&self, rows: &[Row]) -> Result<u64> {
        let mut written = 0;
        for chunk in rows.chunks(self.chunk_size) {
            let count = self
                .db
                .append_rows(&self.table, chunk)
                .await
                .map_err(|e| Error::write(&self.table, e))?;
            self.chunks.fetch_add(1, Ordering::Relaxed);
            self.rows.fetch_add(count, Ordering::Relaxed);
            written += count;
        }
        Ok(written)
    }

    async fn finish(&self) -> Result<()> {
        tracing::info!(
            table = %self.table,
            rows = self.rows_written(),
            chunks = self.chunks_written(),
            "Table load complete"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.table
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_db() -> (Arc<Database>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("qualer.db")).await.unwrap();
        (Arc::new(db), dir)
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                json!({"CapabilityId": i, "TechniqueId": 10, "CertificationId": 284})
                    .as_object()
                    .cloned()
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_rows_split_into_chunks() {
        let (db, _dir) = test_db().await;
        let sink = TableSink::open(Arc::clone(&db), "capabilities", IfExists::Replace, 500)
            .await
            .unwrap();

        let written = sink.write_rows(&rows(1201)).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(written, 1201);
        assert_eq!(sink.chunks_written(), 3);
        assert_eq!(db.count_rows("capabilities").await.unwrap(), 1201);
    }

    #[tokio::test]
    async fn test_replace_drops_once_at_open() {
        let (db, _dir) = test_db().await;
        db.append_rows("capabilities", &rows(7)).await.unwrap();

        let sink = TableSink::open(Arc::clone(&db), "capabilities", IfExists::Replace, 2)
            .await
            .unwrap();
        assert!(!db.table_exists("capabilities").await.unwrap());

        sink.write_rows(&rows(3)).await.unwrap();
        sink.write_rows(&rows(2)).await.unwrap();

        assert_eq!(db.count_rows("capabilities").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_append_keeps_existing_rows() {
        let (db, _dir) = test_db().await;
        db.append_rows("capabilities", &rows(7)).await.unwrap();

        let sink = TableSink::open(Arc::clone(&db), "capabilities", IfExists::Append, 500)
            .await
            .unwrap();
        sink.write_rows(&rows(3)).await.unwrap();

        assert_eq!(db.count_rows("capabilities").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_write_error() {
        let (db, _dir) = test_db().await;
        let sink = TableSink::open(Arc::clone(&db), "capabilities", IfExists::Replace, 500)
            .await
            .unwrap();
        db.pool().close().await;

        let err = sink.write_rows(&rows(1)).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Write);
        assert_eq!(sink.rows_written(), 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let (db, _dir) = test_db().await;
        assert!(
            TableSink::open(db, "capabilities", IfExists::Append, 0)
                .await
                .is_err()
        );
    }
}
