//! Post-load maintenance and reference id columns.
//!
//! Nothing here runs while a batch is streaming rows in; these are separate steps run
//! once a load has finished.

use crate::error::DatabaseError;
use crate::types::ReferenceId;
use crate::{Error, Result};
use sqlx::{Connection as _, Row as _};

use super::tables::columns_on;
use super::{ColumnInfo, Database, query_failed, quote_ident};

/// A foreign key as reported by `PRAGMA foreign_key_list`
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    column: String,
    ref_table: String,
    ref_column: Option<String>,
}

impl ForeignKey {
    fn matches(&self, column: &str, ref_table: &str, ref_column: &str) -> bool {
        self.column.eq_ignore_ascii_case(column)
            && self.ref_table.eq_ignore_ascii_case(ref_table)
            && self
                .ref_column
                .as_deref()
                .is_none_or(|c| c.eq_ignore_ascii_case(ref_column))
    }

    fn clause(&self) -> Result<String> {
        let target = match &self.ref_column {
            Some(column) => format!("{}({})", quote_ident(&self.ref_table)?, quote_ident(column)?),
            None => quote_ident(&self.ref_table)?,
        };
        Ok(format!(
            "FOREIGN KEY ({}) REFERENCES {}",
            quote_ident(&self.column)?,
            target
        ))
    }
}

impl Database {
    /// Keep only the last-inserted row for every non-null value of `key`
    ///
    /// Rows whose key is NULL are left alone. Returns the number of rows removed;
    /// running it again removes nothing.
    pub async fn dedupe_by_key(&self, table: &str, key: &str) -> Result<u64> {
        self.require_column(table, key).await?;

        let t = quote_ident(table)?;
        let k = quote_ident(key)?;
        let sql = format!(
            "DELETE FROM {t} WHERE {k} IS NOT NULL AND rowid NOT IN \
             (SELECT MAX(rowid) FROM {t} WHERE {k} IS NOT NULL GROUP BY {k})"
        );
        let removed = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to remove duplicate rows", e))?
            .rows_affected();

        tracing::info!(table, key, removed, "Deduplicated table");
        Ok(removed)
    }

    /// Declare `table.column` a foreign key into `ref_table.ref_column`
    ///
    /// SQLite cannot add a constraint to an existing table, so the table is rebuilt with
    /// the constraint inside one transaction (column names, types, NOT NULL, defaults,
    /// primary key, existing foreign keys and indexes are carried over). A unique index
    /// is created on the referenced column if it has none.
    ///
    /// The rebuild runs on one connection with foreign key enforcement switched off, so
    /// tables that already reference `table` survive the drop and rename. Every foreign
    /// key in the database is checked before the rebuild commits, and enforcement is
    /// switched back on afterwards.
    ///
    /// Returns `false` without touching anything when the constraint already exists.
    /// Fails with [`DatabaseError::ConstraintViolation`] when some non-null value of
    /// `column` has no match in `ref_table`.
    pub async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        ref_table: &str,
        ref_column: &str,
    ) -> Result<bool> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("Failed to acquire connection", e))?;

        // Has no effect inside a transaction, so it is switched before BEGIN
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(&mut *conn)
            .await
            .map_err(|e| query_failed("Failed to disable foreign keys", e))?;

        let rebuilt =
            rebuild_with_foreign_key(&mut conn, table, column, ref_table, ref_column).await;

        let restored = sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut *conn)
            .await;
        if restored.is_err() {
            // Never hand a connection without enforcement back to the pool
            conn.close_on_drop();
        }

        let added = rebuilt?;
        restored.map_err(|e| query_failed("Failed to re-enable foreign keys", e))?;
        if added {
            tracing::info!(table, column, ref_table, ref_column, "Added foreign key");
        }
        Ok(added)
    }

    /// Distinct non-null values of `table.column` as reference ids, in first-seen order
    ///
    /// Text values are cast to integers, so a column loaded from CSV works too.
    pub async fn reference_ids(&self, table: &str, column: &str) -> Result<Vec<ReferenceId>> {
        self.require_column(table, column).await?;

        let t = quote_ident(table)?;
        let c = quote_ident(column)?;
        sqlx::query_scalar::<_, ReferenceId>(&format!(
            "SELECT CAST({c} AS INTEGER) FROM {t} WHERE {c} IS NOT NULL \
             GROUP BY {c} ORDER BY MIN(rowid)"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to read reference ids", e))
    }

    async fn require_column(&self, table: &str, column: &str) -> Result<()> {
        let columns = self.table_columns(table).await?;
        require(&columns, table, column)
    }
}

/// Rebuild `table` with one more foreign key; `conn` must have enforcement off
async fn rebuild_with_foreign_key(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    column: &str,
    ref_table: &str,
    ref_column: &str,
) -> Result<bool> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| query_failed("Failed to begin transaction", e))?;

    let columns = columns_on(&mut *tx, table).await?;
    require(&columns, table, column)?;
    let ref_columns = columns_on(&mut *tx, ref_table).await?;
    require(&ref_columns, ref_table, ref_column)?;

    let mut foreign_keys = foreign_keys_on(&mut *tx, table).await?;
    if foreign_keys
        .iter()
        .any(|fk| fk.matches(column, ref_table, ref_column))
    {
        tracing::debug!(table, column, ref_table, "Foreign key already present");
        return Ok(false);
    }

    let t = quote_ident(table)?;
    let c = quote_ident(column)?;
    let rt = quote_ident(ref_table)?;
    let rc = quote_ident(ref_column)?;

    let orphans: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM {t} WHERE {c} IS NOT NULL \
         AND {c} NOT IN (SELECT {rc} FROM {rt} WHERE {rc} IS NOT NULL)"
    ))
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| query_failed("Failed to count orphan rows", e))?;
    if orphans > 0 {
        return Err(Error::Database(DatabaseError::ConstraintViolation(format!(
            "{} rows of {}.{} have no match in {}.{}",
            orphans, table, column, ref_table, ref_column
        ))));
    }

    let unique_index = quote_ident(&format!("{}_{}_key", ref_table, ref_column))?;
    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {unique_index} ON {rt} ({rc})"
    ))
    .execute(&mut *tx)
    .await
    .map_err(|e| {
        Error::Database(DatabaseError::ConstraintViolation(format!(
            "{}.{} is not unique: {}",
            ref_table, ref_column, e
        )))
    })?;

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL",
    )
    .bind(table)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| query_failed("Failed to read indexes", e))?;

    foreign_keys.push(ForeignKey {
        column: column.to_string(),
        ref_table: ref_table.to_string(),
        ref_column: Some(ref_column.to_string()),
    });
    let definitions = table_definitions(&mut *tx, table, &foreign_keys).await?;

    let scratch = quote_ident(&format!("{}__rebuild", table))?;
    let names = columns
        .iter()
        .map(|col| quote_ident(&col.name))
        .collect::<Result<Vec<_>>>()?
        .join(", ");

    let statements = [
        format!("CREATE TABLE {scratch} ({definitions})"),
        format!("INSERT INTO {scratch} ({names}) SELECT {names} FROM {t} ORDER BY rowid"),
        format!("DROP TABLE {t}"),
        format!("ALTER TABLE {scratch} RENAME TO {t}"),
    ];
    for sql in statements.iter().chain(indexes.iter()) {
        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to rebuild table", e))?;
    }

    let violations = sqlx::query("PRAGMA foreign_key_check")
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to check foreign keys", e))?;
    if let Some(first) = violations.first() {
        let child: String = first.try_get(0).unwrap_or_default();
        return Err(Error::Database(DatabaseError::ConstraintViolation(format!(
            "rebuilding {} leaves {} foreign key violations (first in {})",
            table,
            violations.len(),
            child
        ))));
    }

    tx.commit()
        .await
        .map_err(|e| query_failed("Failed to commit table rebuild", e))?;
    Ok(true)
}

fn require(columns: &[ColumnInfo], table: &str, column: &str) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::Database(DatabaseError::NotFound(format!(
            "table {}",
            table
        ))));
    }
    if !columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
        return Err(Error::Database(DatabaseError::NotFound(format!(
            "column {}.{}",
            table, column
        ))));
    }
    Ok(())
}

async fn foreign_keys_on(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
) -> Result<Vec<ForeignKey>> {
    let rows = sqlx::query(&format!("PRAGMA foreign_key_list({})", quote_ident(table)?))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to read foreign keys", e))?;

    rows.iter()
        .map(|row| {
            Ok(ForeignKey {
                column: row.try_get("from")?,
                ref_table: row.try_get("table")?,
                ref_column: row.try_get("to")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| query_failed("Failed to decode foreign keys", e))
}

/// Column definitions plus table constraints for a rebuilt `table`
async fn table_definitions(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    foreign_keys: &[ForeignKey],
) -> Result<String> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", quote_ident(table)?))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to read table info", e))?;

    let mut definitions = Vec::new();
    let mut primary_key: Vec<(i64, String)> = Vec::new();
    for row in &rows {
        let name: String = row
            .try_get("name")
            .map_err(|e| query_failed("Failed to decode table info", e))?;
        let declared_type: String = row.try_get("type").unwrap_or_default();
        let not_null: i64 = row.try_get("notnull").unwrap_or(0);
        let default: Option<String> = row.try_get("dflt_value").unwrap_or(None);
        let pk: i64 = row.try_get("pk").unwrap_or(0);

        let mut definition = format!("{} {}", quote_ident(&name)?, declared_type);
        if not_null != 0 {
            definition.push_str(" NOT NULL");
        }
        if let Some(default) = default {
            definition.push_str(" DEFAULT ");
            definition.push_str(&default);
        }
        definitions.push(definition.trim_end().to_string());
        if pk > 0 {
            primary_key.push((pk, name));
        }
    }

    if !primary_key.is_empty() {
        primary_key.sort();
        let names = primary_key
            .iter()
            .map(|(_, name)| quote_ident(name))
            .collect::<Result<Vec<_>>>()?;
        definitions.push(format!("PRIMARY KEY ({})", names.join(", ")));
    }
    for fk in foreign_keys {
        definitions.push(fk.clause()?);
    }
    Ok(definitions.join(", "))
}
