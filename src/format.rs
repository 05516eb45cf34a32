//! Result presentation: terminal tables and CSV export
//!
//! Pure transforms over the result envelope. Column order and row order are
//! preserved exactly as the database returned them.

use crate::agent::ExecutionResult;
use crate::agent::error::{AskError, AskResult};
use prettytable::{Cell, Row, Table, format};
use regex::Regex;

/// Parameters handed to whatever delivers the CSV (download, file write)
#[derive(Debug, Clone, PartialEq)]
pub struct CsvExportParams {
    pub file_name: String,
    pub content_type: &'static str,
}

/// Render the result rows as a psql-style grid.
pub fn format_table(result: &ExecutionResult) -> String {
    if result.columns.is_empty() {
        return "(no results)\n".to_string();
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(
        result.columns.iter().map(|c| Cell::new(c)).collect(),
    ));
    for row in &result.rows {
        table.add_row(Row::new(row.iter().map(|v| Cell::new(v)).collect()));
    }
    table.to_string()
}

/// One-line summary printed under the grid.
pub fn format_row_count(result: &ExecutionResult) -> String {
    let rows = match result.row_count {
        1 => "1 row".to_string(),
        n => format!("{n} rows"),
    };
    if result.truncated {
        format!("({rows}, truncated at the row limit)")
    } else {
        format!("({rows})")
    }
}

/// Serialize the result to CSV: header first, then rows in execution order.
pub fn to_csv(result: &ExecutionResult) -> AskResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&result.columns)?;
    for row in &result.rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| AskError::Io(e.into_error()))
}

/// File name and MIME type for delivering the CSV.
///
/// The name is derived from the question so saved exports stay tellable
/// apart.
pub fn csv_export_params(result: &ExecutionResult) -> CsvExportParams {
    let slug_pattern = Regex::new(r"[^a-z0-9]+").expect("static pattern");
    let mut slug = slug_pattern
        .replace_all(&result.question.to_lowercase(), "-")
        .trim_matches('-')
        .to_string();
    slug.truncate(40);
    let slug = slug.trim_matches('-');

    let file_name = if slug.is_empty() {
        "query_results.csv".to_string()
    } else {
        format!("{slug}.csv")
    };
    CsvExportParams {
        file_name,
        content_type: "text/csv",
    }
}
