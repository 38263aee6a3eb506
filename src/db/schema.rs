use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row};

use crate::error::ConfigError;
use crate::models::Row as TextRow;

/// Quote an identifier for SQLite. Embedded quotes are doubled so column
/// names taken from user relations cannot break out of the quoting.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Names the engine derives relations from (target stems, temporary hints)
/// are restricted to plain identifiers.
pub fn validate_ident(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::invalid(
            "identifier",
            format!("invalid identifier: {:?}", name),
        ));
    }
    Ok(())
}

/// Column names of a sqlx row, in select order.
pub(crate) fn row_columns(row: &SqliteRow) -> Vec<String> {
    row.columns().iter().map(|c| c.name().to_string()).collect()
}

/// Decode every column of `row` as text. Integer, real and blob storage
/// classes are rendered the way SQLite would cast them.
pub(crate) fn row_to_text(row: &SqliteRow) -> TextRow {
    let mut out = Vec::with_capacity(row.len());
    for i in 0..row.len() {
        let value = if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v
        } else if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(|n| n.to_string())
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(|f| f.to_string())
        } else if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(i) {
            v.map(|b| String::from_utf8_lossy(&b).into_owned())
        } else {
            None
        };
        out.push(value);
    }
    out
}
