use crate::db::*;
use crate::types::Row;
use tempfile::TempDir;

mod import;

/// Fresh database in its own temp directory (kept alive by the returned guard)
async fn test_db() -> (Database, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = Database::new(&dir.path().join("qualer.db")).await.unwrap();
    (db, dir)
}

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}
