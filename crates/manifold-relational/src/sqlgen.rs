//! SQL construction for the relational adapter.
//!
//! Table and column names coming off the wire are validated as
//! identifiers; every value travels as a bound parameter. All WHERE
//! clauses built here start from `owner_user_id = $1`.

use manifold_core::{Error, Result};

/// The tenant column every row carries.
pub const OWNER_COLUMN: &str = "owner_user_id";
/// Text column consulted by hybrid search.
pub const CONTENT_COLUMN: &str = "content";

#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Built {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

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

fn scalar_param(column: &str, value: &serde_json::Value) -> Result<SqlParam> {
    match value {
        serde_json::Value::String(s) => Ok(SqlParam::Text(s.clone())),
        serde_json::Value::Bool(b) => Ok(SqlParam::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlParam::Int(i))
            } else {
                Ok(SqlParam::Float(n.as_f64().unwrap_or_default()))
            }
        }
        other => Err(Error::InvalidArgument(format!(
            "unsupported value for '{column}': {other}"
        ))),
    }
}

fn parse_object(context: &str, json: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|err| Error::InvalidArgument(format!("invalid {context}: {err}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(Error::InvalidArgument(format!(
            "{context} must be a JSON object"
        ))),
    }
}

/// `owner_user_id = $1 [AND col = $n | AND col IS NULL]...`, appending the
/// bound values to `params`.
fn where_clause(
    user_id: &str,
    filter_json: &str,
    params: &mut Vec<SqlParam>,
) -> Result<String> {
    params.push(SqlParam::Text(user_id.to_string()));
    let mut fragments = vec![format!("{OWNER_COLUMN} = ${}", params.len())];

    if !filter_json.is_empty() {
        for (column, value) in parse_object("filter", filter_json)? {
            identifier(&column)?;
            if value.is_null() {
                fragments.push(format!("{column} IS NULL"));
            } else {
                params.push(scalar_param(&column, &value)?);
                fragments.push(format!("{column} = ${}", params.len()));
            }
        }
    }
    Ok(fragments.join(" AND "))
}

pub fn build_select(
    user_id: &str,
    table: &str,
    filter_json: &str,
    columns: &[String],
    order_by: &str,
    limit: i64,
    offset: i64,
) -> Result<Built> {
    let table = identifier(table)?;
    let projection = if columns.is_empty() {
        "*".to_string()
    } else {
        columns
            .iter()
            .map(|c| identifier(c).map(str::to_owned))
            .collect::<Result<Vec<_>>>()?
            .join(", ")
    };

    let mut params = Vec::new();
    let filter = where_clause(user_id, filter_json, &mut params)?;

    let mut sql = format!("SELECT {projection} FROM {table} WHERE {filter}");
    if !order_by.is_empty() {
        let (column, desc) = match order_by.strip_suffix(" desc") {
            Some(column) => (column, true),
            None => (order_by, false),
        };
        identifier(column)?;
        sql.push_str(&format!(
            " ORDER BY {column}{}",
            if desc { " DESC" } else { "" }
        ));
    }
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if offset > 0 {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    Ok(Built { sql, params })
}

/// Parse an insert body into validated columns and per-row values; `None`
/// renders as a literal NULL. The owner column is forced to the caller on
/// every row.
fn insert_rows(
    user_id: &str,
    rows_json: &str,
) -> Result<(Vec<String>, Vec<Vec<Option<SqlParam>>>)> {
    let value: serde_json::Value = serde_json::from_str(rows_json)
        .map_err(|err| Error::InvalidArgument(format!("invalid rows: {err}")))?;
    let serde_json::Value::Array(rows) = value else {
        return Err(Error::InvalidArgument(
            "rows must be a JSON array of objects".to_string(),
        ));
    };
    if rows.is_empty() {
        return Err(Error::InvalidArgument("rows must not be empty".to_string()));
    }

    let serde_json::Value::Object(first) = &rows[0] else {
        return Err(Error::InvalidArgument(
            "rows must be a JSON array of objects".to_string(),
        ));
    };
    let mut columns: Vec<String> = first
        .keys()
        .filter(|k| k.as_str() != OWNER_COLUMN)
        .cloned()
        .collect();
    for column in &columns {
        identifier(column)?;
    }
    columns.push(OWNER_COLUMN.to_string());

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let serde_json::Value::Object(object) = row else {
            return Err(Error::InvalidArgument(
                "rows must be a JSON array of objects".to_string(),
            ));
        };
        let mut values = Vec::with_capacity(columns.len());
        for column in &columns {
            if column == OWNER_COLUMN {
                values.push(Some(SqlParam::Text(user_id.to_string())));
                continue;
            }
            match object.get(column) {
                None | Some(serde_json::Value::Null) => values.push(None),
                Some(value) => values.push(Some(scalar_param(column, value)?)),
            }
        }
        out.push(values);
    }
    Ok((columns, out))
}

pub fn build_insert(user_id: &str, table: &str, rows_json: &str) -> Result<Built> {
    let table = identifier(table)?;
    let (columns, rows) = insert_rows(user_id, rows_json)?;

    let mut params = Vec::new();
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut placeholders = Vec::with_capacity(row.len());
        for value in row {
            match value {
                Some(value) => {
                    params.push(value);
                    placeholders.push(format!("${}", params.len()));
                }
                None => placeholders.push("NULL".to_string()),
            }
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }

    Ok(Built {
        sql: format!(
            "INSERT INTO {table} ({}) VALUES {}",
            columns.join(", "),
            tuples.join(", "),
        ),
        params,
    })
}

pub fn build_upsert(
    user_id: &str,
    table: &str,
    rows_json: &str,
    conflict_columns: &[String],
) -> Result<Built> {
    if conflict_columns.is_empty() {
        return Err(Error::InvalidArgument(
            "conflict_columns is required".to_string(),
        ));
    }
    for column in conflict_columns {
        identifier(column)?;
    }

    let insert = build_insert(user_id, table, rows_json)?;
    let (columns, _) = insert_rows(user_id, rows_json)?;

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_columns.contains(c) && c.as_str() != OWNER_COLUMN)
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(Built {
        sql: format!(
            "{} ON CONFLICT ({}) {action} WHERE {}.{OWNER_COLUMN} = EXCLUDED.{OWNER_COLUMN}",
            insert.sql,
            conflict_columns.join(", "),
            identifier(table)?,
        ),
        params: insert.params,
    })
}

pub fn build_update(
    user_id: &str,
    table: &str,
    set_json: &str,
    filter_json: &str,
) -> Result<Built> {
    let table = identifier(table)?;
    let mut params = Vec::new();

    let mut assignments = Vec::new();
    for (column, value) in parse_object("set", set_json)? {
        identifier(&column)?;
        if column == OWNER_COLUMN {
            return Err(Error::InvalidArgument(format!(
                "'{OWNER_COLUMN}' cannot be reassigned"
            )));
        }
        if value.is_null() {
            assignments.push(format!("{column} = NULL"));
        } else {
            params.push(scalar_param(&column, &value)?);
            assignments.push(format!("{column} = ${}", params.len()));
        }
    }
    if assignments.is_empty() {
        return Err(Error::InvalidArgument("set must not be empty".to_string()));
    }

    let filter = where_clause(user_id, filter_json, &mut params)?;
    Ok(Built {
        sql: format!(
            "UPDATE {table} SET {} WHERE {filter}",
            assignments.join(", "),
        ),
        params,
    })
}

pub fn build_delete(user_id: &str, table: &str, filter_json: &str) -> Result<Built> {
    let table = identifier(table)?;
    let mut params = Vec::new();
    let filter = where_clause(user_id, filter_json, &mut params)?;
    Ok(Built {
        sql: format!("DELETE FROM {table} WHERE {filter}"),
        params,
    })
}

/// pgvector's input literal.
pub fn vector_literal(vector: &[f32]) -> String {
    let inner = vector
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{inner}]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn selects_are_owner_scoped() {
        let built = build_select("alice", "documents", "", &[], "", 0, 0).unwrap();
        assert_eq!(built.sql, "SELECT * FROM documents WHERE owner_user_id = $1");
        assert_eq!(built.params, vec![SqlParam::Text("alice".to_string())]);
    }

    #[test]
    fn select_filters_order_and_paginate() {
        let built = build_select(
            "alice",
            "documents",
            r#"{"status":"open","priority":2}"#,
            &["id".to_string(), "title".to_string()],
            "created_at desc",
            10,
            20,
        )
        .unwrap();
        assert!(built.sql.starts_with("SELECT id, title FROM documents WHERE owner_user_id = $1"));
        assert!(built.sql.contains("priority = $"));
        assert!(built.sql.contains("status = $"));
        assert!(built.sql.ends_with("ORDER BY created_at DESC LIMIT 10 OFFSET 20"));
        assert_eq!(built.params.len(), 3);
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        assert!(build_select("alice", "documents; drop table x", "", &[], "", 0, 0).is_err());
        assert!(build_select("alice", "documents", r#"{"bad col":1}"#, &[], "", 0, 0).is_err());
        assert!(build_select("alice", "documents", "", &[], "title; --", 0, 0).is_err());
    }

    #[test]
    fn inserts_force_the_owner_column() {
        let built = build_insert(
            "alice",
            "documents",
            r#"[{"title":"a","rank":1},{"title":"b","rank":2}]"#,
        )
        .unwrap();
        assert!(built.sql.contains("owner_user_id"));
        assert_eq!(built.params.len(), 6);
        assert!(built
            .params
            .iter()
            .filter(|p| **p == SqlParam::Text("alice".to_string()))
            .count()
            == 2);
    }

    #[test]
    fn owner_column_in_rows_is_overridden() {
        let built = build_insert(
            "alice",
            "documents",
            r#"[{"title":"a","owner_user_id":"mallory"}]"#,
        )
        .unwrap();
        assert!(!built
            .params
            .contains(&SqlParam::Text("mallory".to_string())));
        assert!(built.params.contains(&SqlParam::Text("alice".to_string())));
    }

    #[test]
    fn updates_cannot_reassign_the_owner() {
        assert!(build_update(
            "alice",
            "documents",
            r#"{"owner_user_id":"mallory"}"#,
            ""
        )
        .is_err());

        let built = build_update(
            "alice",
            "documents",
            r#"{"status":"closed"}"#,
            r#"{"id":7}"#,
        )
        .unwrap();
        assert!(built.sql.starts_with("UPDATE documents SET status = $1"));
        assert!(built.sql.contains("owner_user_id = $2"));
        assert!(built.sql.contains("id = $3"));
    }

    #[test]
    fn upserts_guard_cross_tenant_conflicts() {
        let built = build_upsert(
            "alice",
            "documents",
            r#"[{"id":1,"title":"a"}]"#,
            &["id".to_string()],
        )
        .unwrap();
        assert!(built.sql.contains("ON CONFLICT (id) DO UPDATE SET"));
        assert!(built
            .sql
            .contains("documents.owner_user_id = EXCLUDED.owner_user_id"));
    }

    #[test]
    fn vector_literals_match_pgvector_input() {
        assert_eq!(vector_literal(&[1.0, 0.5, 0.0]), "[1,0.5,0]");
        assert_eq!(vector_literal(&[]), "[]");
    }
}
