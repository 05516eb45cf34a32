//! SQLite access layer
//!
//! Thin wrapper over a `sqlx` pool. Execution is bounded: a row limit caps
//! result size and a statement timeout caps wall-clock time. Connections are
//! pooled and returned on drop, so no transaction ever spans a model round
//! trip.

use crate::agent::error::{AskError, AskResult};
use futures_util::TryStreamExt;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::debug;

/// Raw output of one executed statement: header plus string cells.
#[derive(Debug, Clone, Default)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub truncated: bool,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open a pooled connection to a SQLite database file or URL.
    ///
    /// The database must already exist; the agent never creates it.
    pub async fn connect(path: &str) -> AskResult<Self> {
        let database_url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite://{path}")
        };

        // A pool of :memory: connections would yield independent databases
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        debug!("connecting to {database_url}");
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&database_url)
            .await
            .map_err(|e| {
                AskError::Configuration(format!("cannot open database {path}: {e}"))
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute one validated statement.
    ///
    /// At most `row_limit` rows are collected; further rows are discarded and
    /// the output is marked truncated. The statement is abandoned once
    /// `statement_timeout` elapses.
    pub async fn execute(
        &self,
        sql: &str,
        row_limit: usize,
        statement_timeout: Duration,
    ) -> AskResult<QueryOutput> {
        match tokio::time::timeout(statement_timeout, self.collect(sql, row_limit)).await {
            Ok(result) => result,
            Err(_) => Err(AskError::Execution(format!(
                "statement exceeded the {}s timeout",
                statement_timeout.as_secs()
            ))),
        }
    }

    async fn collect(&self, sql: &str, row_limit: usize) -> AskResult<QueryOutput> {
        let mut stream = sqlx::query(sql).fetch(&self.pool);
        let mut output = QueryOutput::default();

        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| AskError::Execution(e.to_string()))?
        {
            if output.columns.is_empty() {
                output.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            if output.rows.len() >= row_limit {
                output.truncated = true;
                break;
            }
            let mut cells = Vec::with_capacity(row.columns().len());
            for idx in 0..row.columns().len() {
                cells.push(format_cell(&row, idx));
            }
            output.rows.push(cells);
        }

        debug!(
            "query returned {} rows (truncated: {})",
            output.rows.len(),
            output.truncated
        );
        Ok(output)
    }

    /// Fetch the first `limit` rows of a table as string cells.
    pub async fn sample_rows(&self, table: &str, limit: usize) -> AskResult<Vec<Vec<String>>> {
        let sql = format!(
            "SELECT * FROM \"{}\" LIMIT {limit}",
            table.replace('"', "\"\"")
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AskError::Introspection(format!("failed to sample {table}: {e}")))?;

        Ok(rows
            .iter()
            .map(|row| {
                (0..row.columns().len())
                    .map(|idx| format_cell(row, idx))
                    .collect()
            })
            .collect())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Format a dynamically-typed SQLite value to its string representation
fn format_cell(row: &SqliteRow, idx: usize) -> String {
    if let Ok(value_ref) = row.try_get_raw(idx) {
        if value_ref.is_null() {
            return String::new();
        }
    }

    // SQLite columns are dynamically typed, so try the storage classes in order
    if let Ok(val) = row.try_get::<i64, _>(idx) {
        return val.to_string();
    }
    if let Ok(val) = row.try_get::<f64, _>(idx) {
        return val.to_string();
    }
    if let Ok(val) = row.try_get::<String, _>(idx) {
        return val;
    }
    if let Ok(val) = row.try_get::<Vec<u8>, _>(idx) {
        return format!("\\x{}", hex::encode(val));
    }

    let type_name = row.column(idx).type_info().name().to_string();
    format!("[unsupported {type_name} value]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn seeded_db() -> (NamedTempFile, Database) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::connect(file.path().to_str().unwrap())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE nums (n INTEGER, label TEXT, ratio REAL)")
            .execute(db.pool())
            .await
            .unwrap();
        for i in 0..10i64 {
            sqlx::query("INSERT INTO nums (n, label, ratio) VALUES (?, ?, ?)")
                .bind(i)
                .bind(format!("row-{i}"))
                .bind(i as f64 / 2.0)
                .execute(db.pool())
                .await
                .unwrap();
        }
        (file, db)
    }

    #[tokio::test]
    async fn test_execute_collects_columns_and_rows() {
        let (_file, db) = seeded_db().await;
        let out = db
            .execute(
                "SELECT n, label, ratio FROM nums ORDER BY n",
                100,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(out.columns, vec!["n", "label", "ratio"]);
        assert_eq!(out.rows.len(), 10);
        assert_eq!(out.rows[0], vec!["0", "row-0", "0"]);
        assert_eq!(out.rows[3], vec!["3", "row-3", "1.5"]);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_execute_applies_row_limit() {
        let (_file, db) = seeded_db().await;
        let out = db
            .execute("SELECT n FROM nums ORDER BY n", 4, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(out.rows.len(), 4);
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_execute_reports_engine_errors() {
        let (_file, db) = seeded_db().await;
        let err = db
            .execute("SELECT missing FROM nums", 10, Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            AskError::Execution(msg) => assert!(msg.contains("missing")),
            other => panic!("expected Execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_cells_render_empty() {
        let (_file, db) = seeded_db().await;
        sqlx::query("INSERT INTO nums (n, label, ratio) VALUES (99, NULL, NULL)")
            .execute(db.pool())
            .await
            .unwrap();

        let out = db
            .execute(
                "SELECT label, ratio FROM nums WHERE n = 99",
                10,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(out.rows[0], vec!["", ""]);
    }

    #[tokio::test]
    async fn test_sample_rows() {
        let (_file, db) = seeded_db().await;
        let rows = db.sample_rows("nums", 3).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].len(), 3);
    }

    #[tokio::test]
    async fn test_select_leaves_data_unchanged() {
        let (_file, db) = seeded_db().await;
        let before = db
            .execute("SELECT COUNT(*) FROM nums", 1, Duration::from_secs(5))
            .await
            .unwrap();

        db.execute("SELECT * FROM nums", 100, Duration::from_secs(5))
            .await
            .unwrap();

        let after = db
            .execute("SELECT COUNT(*) FROM nums", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(before.rows, after.rows);
    }
}
