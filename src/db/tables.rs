//! Dynamic tables: creation from rows, schema widening, chunked appends, reads.

use crate::types::Row;
use crate::Result;
use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column as _, Row as _, Sqlite, TypeInfo as _, ValueRef as _};

use super::{Affinity, ColumnInfo, Database, query_failed, quote_ident};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

impl Database {
    /// Whether `table` exists
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| query_failed("Failed to look up table", e))?;

        Ok(count > 0)
    }

    /// Columns of `table` in declaration order; empty if the table does not exist
    pub async fn table_columns(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("Failed to acquire connection", e))?;
        columns_on(&mut conn, table).await
    }

    /// Drop `table` if it exists
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table)?);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to drop table", e))?;

        tracing::info!(table, "Dropped table");
        Ok(())
    }

    /// Number of rows in `table`
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table)?);
        sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to count rows", e))
    }

    /// Every row of `table` in insertion order
    pub async fn select_rows(&self, table: &str) -> Result<Vec<Row>> {
        let sql = format!("SELECT * FROM {} ORDER BY rowid", quote_ident(table)?);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| query_failed("Failed to select rows", e))?;

        rows.iter()
            .map(decode_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| query_failed("Failed to decode row", e))
    }

    /// Append `rows` to `table` in a single transaction
    ///
    /// The table is created from the rows' fields if it does not exist yet, and fields
    /// it lacks are added as new columns first. Missing fields are stored as NULL.
    pub async fn append_rows(&self, table: &str, rows: &[Row]) -> Result<u64> {
        let plan = column_plan(rows);
        if plan.is_empty() {
            return Ok(0);
        }
        self.ensure_columns(table, &plan).await?;

        let columns = plan
            .iter()
            .map(|(name, _)| quote_ident(name))
            .collect::<Result<Vec<_>>>()?;
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table)?,
            columns.join(", "),
            vec!["?"; columns.len()].join(", ")
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        for row in rows {
            let query = plan
                .iter()
                .fold(sqlx::query(&sql), |query, (name, _)| {
                    bind_value(query, field(row, name))
                });
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to insert row", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to commit rows", e))?;

        tracing::debug!(table, rows = rows.len(), "Appended chunk");
        Ok(rows.len() as u64)
    }

    /// Create `table` with `columns`, or add whichever of them it lacks
    pub(crate) async fn ensure_columns(
        &self,
        table: &str,
        columns: &[(String, Affinity)],
    ) -> Result<()> {
        let _guard = self.schema_lock.lock().await;
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| query_failed("Failed to acquire connection", e))?;

        let existing = columns_on(&mut conn, table).await?;
        if existing.is_empty() {
            let definitions = columns
                .iter()
                .map(|(name, affinity)| {
                    Ok(format!("{} {}", quote_ident(name)?, affinity.sql_type()))
                })
                .collect::<Result<Vec<_>>>()?;
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote_ident(table)?,
                definitions.join(", ")
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| query_failed("Failed to create table", e))?;

            tracing::info!(table, columns = columns.len(), "Created table");
            return Ok(());
        }

        for (name, affinity) in columns {
            if existing.iter().any(|c| c.name.eq_ignore_ascii_case(name)) {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table)?,
                quote_ident(name)?,
                affinity.sql_type()
            );
            sqlx::query(&sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| query_failed("Failed to add column", e))?;

            tracing::info!(table, column = %name, "Added column");
        }
        Ok(())
    }
}

/// Columns of `table` read through an existing connection
pub(super) async fn columns_on(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
) -> Result<Vec<ColumnInfo>> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
    let rows = sqlx::query(&sql)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_failed("Failed to read table info", e))?;

    rows.iter()
        .map(|row| {
            Ok(ColumnInfo {
                name: row.try_get("name")?,
                declared_type: row.try_get("type")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(|e| query_failed("Failed to decode table info", e))
}

/// Union of the rows' fields in first-seen order, with the affinity of the first
/// non-null value (TEXT when every value is null)
///
/// SQLite column names are case-insensitive, so fields differing only in case collapse
/// onto the first spelling seen; rows using another spelling still bind into it.
pub(crate) fn column_plan(rows: &[Row]) -> Vec<(String, Affinity)> {
    let mut plan: Vec<(String, Option<Affinity>)> = Vec::new();
    for row in rows {
        for (key, value) in row {
            match plan
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
            {
                Some((_, affinity)) => {
                    if affinity.is_none() {
                        *affinity = Affinity::of(value);
                    }
                }
                None => plan.push((key.clone(), Affinity::of(value))),
            }
        }
    }
    plan.into_iter()
        .map(|(name, affinity)| (name, affinity.unwrap_or(Affinity::Text)))
        .collect()
}

/// `row[name]`, falling back to a key that differs only in case
fn field<'r>(row: &'r Row, name: &str) -> Option<&'r Value> {
    row.get(name).or_else(|| {
        row.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: Option<&Value>) -> SqliteQuery<'q> {
    match value {
        None | Some(Value::Null) => query.bind(None::<String>),
        Some(Value::Bool(b)) => query.bind(i64::from(*b)),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Some(Value::String(s)) => query.bind(s.clone()),
        Some(nested) => query.bind(nested.to_string()),
    }
}

fn decode_row(row: &SqliteRow) -> std::result::Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_owned();
            match storage.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(index)?),
                "REAL" => Value::from(row.try_get::<f64, _>(index)?),
                "BLOB" => Value::from(
                    String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index)?).into_owned(),
                ),
                _ => Value::from(row.try_get::<String, _>(index)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
