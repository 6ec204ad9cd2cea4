//! SQL fragment validation and rewriting for the analytics engine.
//!
//! Identifiers coming off the wire are validated before splicing;
//! row caps are applied by wrapping the query rather than parsing it.

use manifold_core::{Error, Result};

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => (),
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn identifier(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(Error::InvalidArgument(format!(
            "'{name}' is not a valid identifier"
        )))
    }
}

/// Column types allowed in wire-defined tables.
pub fn column_type(sql_type: &str) -> Result<&str> {
    const ALLOWED: &[&str] = &[
        "BOOLEAN", "TINYINT", "SMALLINT", "INTEGER", "BIGINT", "HUGEINT", "FLOAT", "DOUBLE",
        "DECIMAL", "VARCHAR", "TEXT", "BLOB", "DATE", "TIME", "TIMESTAMP", "TIMESTAMPTZ",
        "INTERVAL", "UUID", "JSON",
    ];
    let upper = sql_type.trim().to_ascii_uppercase();
    // DECIMAL(18,3) and friends keep their precision suffix.
    let base = upper.split('(').next().unwrap_or_default().trim().to_string();
    if ALLOWED.contains(&base.as_str()) {
        Ok(sql_type.trim())
    } else {
        Err(Error::InvalidArgument(format!(
            "unsupported column type '{sql_type}'"
        )))
    }
}

/// Whether the statement already carries a LIMIT clause.
fn has_limit(sql: &str) -> bool {
    let lower = sql.to_lowercase();
    lower
        .split_whitespace()
        .any(|token| token == "limit")
}

/// Wrap a query with an implicit row cap unless it already limits itself.
pub fn apply_row_cap(sql: &str, max_rows: i64) -> String {
    if max_rows <= 0 || has_limit(sql) {
        sql.to_string()
    } else {
        format!("SELECT * FROM ({sql}) LIMIT {max_rows}")
    }
}

/// File-format functions for object-store import, and COPY format names
/// for export.
pub fn read_function(format: &str) -> Result<&'static str> {
    match format.to_ascii_lowercase().as_str() {
        "csv" => Ok("read_csv_auto"),
        "parquet" => Ok("read_parquet"),
        "json" => Ok("read_json_auto"),
        // Arrow IPC needs the engine's arrow extension; loading is
        // attempted at startup and missing support surfaces as a backend
        // error.
        "arrow" => Ok("read_arrow"),
        other => Err(Error::InvalidArgument(format!(
            "unsupported import format '{other}'"
        ))),
    }
}

pub fn copy_format(format: &str) -> Result<&'static str> {
    match format.to_ascii_lowercase().as_str() {
        "csv" => Ok("CSV, HEADER"),
        "parquet" => Ok("PARQUET"),
        "json" => Ok("JSON"),
        "arrow" => Ok("ARROW"),
        other => Err(Error::InvalidArgument(format!(
            "unsupported export format '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_validated() {
        assert!(identifier("events").is_ok());
        assert!(identifier("org_acme").is_ok());
        assert!(identifier("1bad").is_err());
        assert!(identifier("drop table x").is_err());
        assert!(identifier("").is_err());
    }

    #[test]
    fn column_types_allow_precision_suffixes() {
        assert!(column_type("BIGINT").is_ok());
        assert!(column_type("decimal(18,3)").is_ok());
        assert!(column_type("varchar").is_ok());
        assert!(column_type("GEOMETRY").is_err());
    }

    #[test]
    fn row_cap_wraps_unlimited_queries() {
        assert_eq!(
            apply_row_cap("SELECT * FROM t", 100),
            "SELECT * FROM (SELECT * FROM t) LIMIT 100"
        );
        assert_eq!(apply_row_cap("SELECT * FROM t LIMIT 5", 100), "SELECT * FROM t LIMIT 5");
        assert_eq!(apply_row_cap("select * from t limit 5", 100), "select * from t limit 5");
        assert_eq!(apply_row_cap("SELECT * FROM t", 0), "SELECT * FROM t");
    }

    #[test]
    fn formats_map_to_engine_functions() {
        assert_eq!(read_function("csv").unwrap(), "read_csv_auto");
        assert_eq!(read_function("PARQUET").unwrap(), "read_parquet");
        assert_eq!(copy_format("csv").unwrap(), "CSV, HEADER");
        assert!(read_function("xlsx").is_err());
        assert!(copy_format("xlsx").is_err());
    }
}
