//! Schema introspection for prompt grounding and SQL validation
//!
//! Builds a fresh description of the connected database on every request.
//! The rendered text block is what the model sees; the structured form is
//! what the validator checks generated SQL against.

use crate::agent::error::{AskError, AskResult};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use std::collections::HashMap;
use tracing::debug;

/// Column metadata as declared in the table definition
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// A single user table with its columns in declaration order
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Ordered description of every user table in the database
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchemaDescription {
    pub tables: Vec<TableSchema>,
}

impl SchemaDescription {
    /// Enumerate all user tables and views with their columns.
    ///
    /// Read-only; `sqlite_*` internals are excluded.
    pub async fn introspect(pool: &SqlitePool) -> AskResult<Self> {
        let rows = sqlx::query(
            r#"
            SELECT name
            FROM sqlite_master
            WHERE type IN ('table', 'view')
              AND name NOT LIKE 'sqlite_%'
            ORDER BY name
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| AskError::Introspection(format!("failed to enumerate tables: {e}")))?;

        let mut tables = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row
                .try_get("name")
                .map_err(|e| AskError::Introspection(format!("failed to read table name: {e}")))?;
            let columns = Self::introspect_columns(pool, &name).await?;
            tables.push(TableSchema { name, columns });
        }

        debug!("introspected {} tables", tables.len());
        Ok(Self { tables })
    }

    async fn introspect_columns(pool: &SqlitePool, table: &str) -> AskResult<Vec<ColumnSchema>> {
        // PRAGMA arguments cannot be bound, so the identifier is quoted inline
        let query = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
        let rows = sqlx::query(&query).fetch_all(pool).await.map_err(|e| {
            AskError::Introspection(format!("failed to read columns of {table}: {e}"))
        })?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            columns.push(ColumnSchema {
                name: row.try_get::<String, _>("name").map_err(|e| {
                    AskError::Introspection(format!("bad table_info row for {table}: {e}"))
                })?,
                data_type: row.try_get::<String, _>("type").unwrap_or_default(),
                not_null: row.try_get::<i64, _>("notnull").unwrap_or(0) != 0,
                primary_key: row.try_get::<i64, _>("pk").unwrap_or(0) != 0,
            });
        }
        Ok(columns)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    /// Check whether any table declares the column.
    pub fn has_column(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.has_column(name))
    }

    /// Render the schema block included in every prompt.
    pub fn render(&self) -> String {
        self.render_with_samples(&HashMap::new())
    }

    /// Render the schema block with optional sample rows per table.
    pub fn render_with_samples(&self, samples: &HashMap<String, Vec<Vec<String>>>) -> String {
        let mut out = String::from("Database Schema:\n\n");
        for table in &self.tables {
            out.push_str(&format!("Table: {}\n", table.name));
            out.push_str("Columns:\n");
            for col in &table.columns {
                out.push_str(&format!("- {} ({})", col.name, col.data_type));
                if col.primary_key {
                    out.push_str(" PRIMARY KEY");
                } else if col.not_null {
                    out.push_str(" NOT NULL");
                }
                out.push('\n');
            }
            if let Some(rows) = samples.get(&table.name) {
                if !rows.is_empty() {
                    out.push_str("Sample data:\n");
                    for row in rows {
                        out.push_str(&format!("- ({})\n", row.join(", ")));
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}
