use super::*;
use crate::config::IfExists;
use serde_json::json;

const SITES_CSV: &str = "SiteId,Name,Latitude,Code\r\n\
                         1,\"North, upper\",51.5,007\r\n\
                         2,\"Say \"\"hi\"\"\",,B\r\n";

#[tokio::test]
async fn test_import_infers_cell_types() {
    let (db, dir) = test_db().await;
    let path = dir.path().join("sites.csv");
    std::fs::write(&path, SITES_CSV).unwrap();

    let loaded = db
        .import_csv("sites", &path, IfExists::Replace, 500)
        .await
        .unwrap();

    assert_eq!(loaded, 2);
    let rows = db.select_rows("sites").await.unwrap();
    assert_eq!(
        rows[0],
        row(json!({"SiteId": 1, "Name": "North, upper", "Latitude": 51.5, "Code": 7}))
    );
    assert_eq!(rows[1]["Name"], json!("Say \"hi\""));
    assert_eq!(rows[1]["Latitude"], json!(null));
    assert_eq!(rows[1]["Code"], json!("B"));
}

#[tokio::test]
async fn test_import_replace_and_append() {
    let (db, dir) = test_db().await;
    let path = dir.path().join("sites.csv");
    std::fs::write(&path, SITES_CSV).unwrap();

    db.import_csv("sites", &path, IfExists::Replace, 1)
        .await
        .unwrap();
    db.import_csv("sites", &path, IfExists::Append, 1)
        .await
        .unwrap();
    assert_eq!(db.count_rows("sites").await.unwrap(), 4);

    db.import_csv("sites", &path, IfExists::Replace, 1)
        .await
        .unwrap();
    assert_eq!(db.count_rows("sites").await.unwrap(), 2);
}

#[tokio::test]
async fn test_import_header_only_creates_empty_table() {
    let (db, dir) = test_db().await;
    let path = dir.path().join("empty.csv");
    std::fs::write(&path, "SiteId,Name\n").unwrap();

    let loaded = db
        .import_csv("sites", &path, IfExists::Replace, 500)
        .await
        .unwrap();

    assert_eq!(loaded, 0);
    assert_eq!(db.table_columns("sites").await.unwrap().len(), 2);
    assert_eq!(db.count_rows("sites").await.unwrap(), 0);
}

#[tokio::test]
async fn test_import_missing_file_is_io_error() {
    let (db, dir) = test_db().await;

    let err = db
        .import_csv(
            "sites",
            &dir.path().join("nope.csv"),
            IfExists::Replace,
            500,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, crate::Error::Io(_)));
}
