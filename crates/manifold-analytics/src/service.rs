//! The columnar-analytics gRPC service.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use duckdb::types::ValueRef;
use manifold_core::{tenant, AdapterContext, Error, Result};
use proto_manifold::analytics::analytics_server::Analytics;
use proto_manifold::analytics::{
    CreateDatabaseRequest, CreateTableRequest, ExecuteQueryRequest, ExecuteQueryResponse,
    ExecuteStatementRequest, ExecuteStatementResponse, ExportToObjectStoreRequest,
    ExportToObjectStoreResponse, ImportFromObjectStoreRequest, ImportFromObjectStoreResponse,
    ListDatabasesRequest, ListDatabasesResponse, QuerySummary,
};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use tokio::io::AsyncWriteExt;
use tonic::{Request, Response, Status};

use crate::sql;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AnalyticsService {
    ctx: AdapterContext,
    conn: Arc<Mutex<duckdb::Connection>>,
    data_dir: String,
    max_rows: i64,
    s3: aws_sdk_s3::Client,
}

fn classify(context: &str, err: duckdb::Error) -> Error {
    let text = err.to_string();
    let lower = text.to_lowercase();
    let detail = format!("{context}: {text}");

    if lower.contains("does not exist") || lower.contains("not found") {
        Error::NotFound(detail)
    } else if lower.contains("already exists") {
        Error::AlreadyExists(detail)
    } else if lower.contains("parser error")
        || lower.contains("syntax error")
        || lower.contains("binder error")
        || lower.contains("conversion error")
        || lower.contains("invalid input")
    {
        Error::InvalidArgument(detail)
    } else if lower.contains("out of memory") {
        Error::ResourceExhausted(detail)
    } else {
        Error::Internal(detail)
    }
}

fn classify_s3<E>(context: &str, err: aws_sdk_s3::error::SdkError<E>) -> Error
where
    E: aws_sdk_s3::error::ProvideErrorMetadata + std::fmt::Debug,
{
    use aws_sdk_s3::error::SdkError;
    match &err {
        SdkError::TimeoutError(_) => {
            return Error::DeadlineExceeded(format!("{context}: object store timed out"))
        }
        SdkError::DispatchFailure(_) => {
            return Error::Unavailable(format!("{context}: object store unreachable"))
        }
        _ => (),
    }
    let code = err.meta().code().unwrap_or_default();
    let message = err.meta().message().unwrap_or_default();
    let detail = format!("{context}: {message}");
    match code {
        "NoSuchBucket" | "NoSuchKey" | "NotFound" => Error::NotFound(detail),
        "AccessDenied" => Error::PermissionDenied(detail),
        _ => Error::Internal(format!("{context}: {err:?}")),
    }
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Boolean(b) => serde_json::Value::Bool(b),
        ValueRef::TinyInt(i) => serde_json::Value::from(i),
        ValueRef::SmallInt(i) => serde_json::Value::from(i),
        ValueRef::Int(i) => serde_json::Value::from(i),
        ValueRef::BigInt(i) => serde_json::Value::from(i),
        ValueRef::HugeInt(i) => serde_json::Value::from(i as i64),
        ValueRef::UTinyInt(i) => serde_json::Value::from(i),
        ValueRef::USmallInt(i) => serde_json::Value::from(i),
        ValueRef::UInt(i) => serde_json::Value::from(i),
        ValueRef::UBigInt(i) => serde_json::Value::from(i),
        ValueRef::Float(f) => serde_json::Value::from(f),
        ValueRef::Double(f) => serde_json::Value::from(f),
        ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("0x{}", hex_string(bytes))),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn params_from_json(params_json: &str) -> Result<Vec<duckdb::types::Value>> {
    if params_json.is_empty() {
        return Ok(Vec::new());
    }
    let json: serde_json::Value = serde_json::from_str(params_json)
        .map_err(|err| Error::InvalidArgument(format!("invalid params: {err}")))?;
    let serde_json::Value::Array(values) = json else {
        return Err(Error::InvalidArgument(
            "params must be a JSON array".to_string(),
        ));
    };
    values
        .iter()
        .map(|value| match value {
            serde_json::Value::Null => Ok(duckdb::types::Value::Null),
            serde_json::Value::Bool(b) => Ok(duckdb::types::Value::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(duckdb::types::Value::BigInt(i))
                } else {
                    Ok(duckdb::types::Value::Double(n.as_f64().unwrap_or_default()))
                }
            }
            serde_json::Value::String(s) => Ok(duckdb::types::Value::Text(s.clone())),
            other => Err(Error::InvalidArgument(format!(
                "unsupported parameter value: {other}"
            ))),
        })
        .collect()
}

/// Switch the connection into the tenant's schema within the named
/// database, creating the schema on first use. Runs under the connection
/// mutex, so the session setting cannot leak across requests.
fn use_schema(conn: &duckdb::Connection, database: &str, schema: &str) -> duckdb::Result<()> {
    conn.execute_batch(&format!(
        "CREATE SCHEMA IF NOT EXISTS {database}.{schema}; USE {database}.{schema};"
    ))
}

fn select_rows(
    conn: &duckdb::Connection,
    sql_text: &str,
    params: Vec<duckdb::types::Value>,
) -> duckdb::Result<(Vec<String>, Vec<serde_json::Value>)> {
    let mut stmt = conn.prepare(sql_text)?;
    let mut rows = stmt.query(duckdb::params_from_iter(params))?;

    let mut columns: Vec<String> = Vec::new();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        if columns.is_empty() {
            columns = row
                .as_ref()
                .column_names()
                .iter()
                .map(|name| name.to_string())
                .collect();
        }
        let mut object = serde_json::Map::new();
        for (index, column) in columns.iter().enumerate() {
            object.insert(column.clone(), value_ref_to_json(row.get_ref(index)?));
        }
        out.push(serde_json::Value::Object(object));
    }
    Ok((columns, out))
}

impl AnalyticsService {
    pub fn new(
        ctx: AdapterContext,
        connection: duckdb::Connection,
        data_dir: String,
        max_rows: i64,
        s3: aws_sdk_s3::Client,
    ) -> Self {
        // Re-attach any databases created by earlier runs, and load the
        // arrow extension if the build carries it.
        if let Err(err) = connection.execute_batch("INSTALL arrow; LOAD arrow;") {
            tracing::debug!(error = %err, "arrow extension unavailable");
        }
        if let Ok(entries) = std::fs::read_dir(&data_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if path.extension().and_then(|e| e.to_str()) != Some("duckdb") || stem == "main" {
                    continue;
                }
                if !sql::is_identifier(stem) {
                    continue;
                }
                if let Err(err) = connection.execute_batch(&format!(
                    "ATTACH IF NOT EXISTS '{}' AS {stem};",
                    path.display()
                )) {
                    tracing::warn!(database = stem, error = %err, "failed to re-attach database");
                }
            }
        }

        Self {
            ctx,
            conn: Arc::new(Mutex::new(connection)),
            data_dir,
            max_rows,
            s3,
        }
    }

    async fn with_conn<T, F>(&self, context: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&duckdb::Connection) -> duckdb::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|err| Error::Internal(format!("{context}: worker panicked: {err}")))?
        .map_err(|err| classify(context, err))
    }

    fn database<'a>(&self, requested: &'a str) -> Result<&'a str> {
        if requested.is_empty() {
            Ok("main")
        } else {
            sql::identifier(requested)
        }
    }

    async fn do_create_database(&self, req: CreateDatabaseRequest) -> Result<Ack> {
        let name = sql::identifier(&req.database)?.to_string();
        let path = std::path::Path::new(&self.data_dir).join(format!("{name}.duckdb"));
        let attach = format!("ATTACH IF NOT EXISTS '{}' AS {name};", path.display());
        self.with_conn("create_database", move |conn| conn.execute_batch(&attach))
            .await?;
        Ok(Ack {})
    }

    async fn do_list_databases(&self, _req: ListDatabasesRequest) -> Result<ListDatabasesResponse> {
        let databases = self
            .with_conn("list_databases", |conn| {
                let mut stmt = conn.prepare("SELECT database_name FROM duckdb_databases()")?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<duckdb::Result<Vec<String>>>()?;
                Ok(names)
            })
            .await?;
        Ok(ListDatabasesResponse { databases })
    }

    async fn do_create_table(&self, req: CreateTableRequest) -> Result<Ack> {
        let database = self.database(&req.database)?.to_string();
        let schema = tenant::analytics_schema(&req.organization_id);
        let table = sql::identifier(&req.table)?.to_string();
        if req.columns.is_empty() {
            return Err(Error::InvalidArgument("columns is required".to_string()));
        }

        let mut columns = Vec::with_capacity(req.columns.len());
        for column in &req.columns {
            let name = sql::identifier(&column.name)?;
            let sql_type = sql::column_type(&column.sql_type)?;
            let not_null = if column.nullable { "" } else { " NOT NULL" };
            columns.push(format!("{name} {sql_type}{not_null}"));
        }
        let if_not_exists = if req.if_not_exists {
            "IF NOT EXISTS "
        } else {
            ""
        };
        let ddl = format!(
            "CREATE TABLE {if_not_exists}{database}.{schema}.{table} ({})",
            columns.join(", "),
        );

        self.with_conn("create_table", move |conn| {
            conn.execute_batch(&format!(
                "CREATE SCHEMA IF NOT EXISTS {database}.{schema}; {ddl};"
            ))
        })
        .await?;
        Ok(Ack {})
    }

    async fn do_execute_query(&self, req: ExecuteQueryRequest) -> Result<ExecuteQueryResponse> {
        if req.sql.trim().is_empty() {
            return Err(Error::InvalidArgument("sql is required".to_string()));
        }
        let database = self.database(&req.database)?.to_string();
        let schema = tenant::analytics_schema(&req.organization_id);
        let params = params_from_json(&req.params_json)?;

        let cap = if req.max_rows > 0 {
            req.max_rows
        } else {
            self.max_rows
        };
        let mut sql_text = sql::apply_row_cap(&req.sql, cap);
        if req.explain {
            sql_text = format!("EXPLAIN {sql_text}");
        }

        let timeout = if req.timeout_ms > 0 {
            Duration::from_millis(req.timeout_ms as u64)
        } else {
            DEFAULT_QUERY_TIMEOUT
        };

        let started = Instant::now();
        let (columns, rows) = tokio::time::timeout(
            timeout,
            self.with_conn("execute_query", move |conn| {
                use_schema(conn, &database, &schema)?;
                select_rows(conn, &sql_text, params)
            }),
        )
        .await
        .map_err(|_| {
            Error::DeadlineExceeded(format!(
                "execute_query: exceeded {}ms",
                timeout.as_millis()
            ))
        })??;

        let row_count = rows.len() as i64;
        Ok(ExecuteQueryResponse {
            columns,
            rows_json: serde_json::Value::Array(rows).to_string(),
            summary: Some(QuerySummary {
                row_count,
                elapsed_ms: started.elapsed().as_millis() as i64,
                truncated: cap > 0 && row_count == cap,
            }),
        })
    }

    async fn do_execute_statement(
        &self,
        req: ExecuteStatementRequest,
    ) -> Result<ExecuteStatementResponse> {
        if req.sql.trim().is_empty() {
            return Err(Error::InvalidArgument("sql is required".to_string()));
        }
        let database = self.database(&req.database)?.to_string();
        let schema = tenant::analytics_schema(&req.organization_id);
        let params = params_from_json(&req.params_json)?;
        let sql_text = req.sql.clone();

        let rows_affected = self
            .with_conn("execute_statement", move |conn| {
                use_schema(conn, &database, &schema)?;
                conn.execute(&sql_text, duckdb::params_from_iter(params))
            })
            .await?;
        Ok(ExecuteStatementResponse {
            rows_affected: rows_affected as i64,
        })
    }

    async fn do_import(
        &self,
        req: ImportFromObjectStoreRequest,
    ) -> Result<ImportFromObjectStoreResponse> {
        let database = self.database(&req.database)?.to_string();
        let schema = tenant::analytics_schema(&req.organization_id);
        let table = sql::identifier(&req.table)?.to_string();
        let read_fn = sql::read_function(&req.format)?;
        let bucket = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        if req.object_key.is_empty() {
            return Err(Error::InvalidArgument("object_key is required".to_string()));
        }

        // Stage the object into a scratch file the engine can scan.
        let staged = tempfile::Builder::new()
            .prefix("import-")
            .tempfile()
            .map_err(|err| Error::Internal(format!("import: staging file: {err}")))?;
        let staged_path = staged.path().to_path_buf();

        let output = self
            .s3
            .get_object()
            .bucket(&bucket)
            .key(&req.object_key)
            .send()
            .await
            .map_err(|err| classify_s3("import_from_object_store", err))?;
        let mut body = output.body;
        let mut file = tokio::fs::File::create(&staged_path)
            .await
            .map_err(|err| Error::Internal(format!("import: staging file: {err}")))?;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| Error::Internal(format!("import: reading object: {err}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| Error::Internal(format!("import: staging file: {err}")))?;
        }
        file.flush()
            .await
            .map_err(|err| Error::Internal(format!("import: staging file: {err}")))?;

        let qualified = format!("{database}.{schema}.{table}");
        let create_table = req.create_table;
        let truncate = req.truncate;
        let path_text = staged_path.display().to_string();

        let rows_imported = self
            .with_conn("import_from_object_store", move |conn| {
                use_schema(conn, &database, &schema)?;
                if create_table {
                    conn.execute_batch(&format!(
                        "CREATE OR REPLACE TABLE {qualified} AS SELECT * FROM {read_fn}('{path_text}');"
                    ))?;
                    conn.query_row(&format!("SELECT count(*) FROM {qualified}"), [], |row| {
                        row.get::<_, i64>(0)
                    })
                } else {
                    if truncate {
                        conn.execute(&format!("DELETE FROM {qualified}"), [])?;
                    }
                    let inserted = conn.execute(
                        &format!(
                            "INSERT INTO {qualified} SELECT * FROM {read_fn}('{path_text}')"
                        ),
                        [],
                    )?;
                    Ok(inserted as i64)
                }
            })
            .await?;

        drop(staged);
        Ok(ImportFromObjectStoreResponse { rows_imported })
    }

    async fn do_export(&self, req: ExportToObjectStoreRequest) -> Result<ExportToObjectStoreResponse> {
        let database = self.database(&req.database)?.to_string();
        let schema = tenant::analytics_schema(&req.organization_id);
        let format = sql::copy_format(&req.format)?;
        let bucket = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        if req.query.trim().is_empty() {
            return Err(Error::InvalidArgument("query is required".to_string()));
        }
        if req.object_key.is_empty() {
            return Err(Error::InvalidArgument("object_key is required".to_string()));
        }

        if !req.overwrite {
            let head = self
                .s3
                .head_object()
                .bucket(&bucket)
                .key(&req.object_key)
                .send()
                .await;
            match head {
                Ok(_) => {
                    return Err(Error::AlreadyExists(format!(
                        "object '{}' already exists",
                        req.object_key
                    )))
                }
                Err(err) => match classify_s3("export_to_object_store", err) {
                    Error::NotFound(_) => (),
                    other => return Err(other),
                },
            }
        }

        let staged = tempfile::Builder::new()
            .prefix("export-")
            .tempfile()
            .map_err(|err| Error::Internal(format!("export: staging file: {err}")))?;
        let staged_path = staged.path().to_path_buf();
        let path_text = staged_path.display().to_string();
        let query = req.query.clone();

        let rows_exported = self
            .with_conn("export_to_object_store", move |conn| {
                use_schema(conn, &database, &schema)?;
                let copied =
                    conn.execute(&format!("COPY ({query}) TO '{path_text}' ({format})"), [])?;
                Ok(copied as i64)
            })
            .await?;

        let size_bytes = tokio::fs::metadata(&staged_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or_default();
        let body = aws_sdk_s3::primitives::ByteStream::from_path(&staged_path)
            .await
            .map_err(|err| Error::Internal(format!("export: reading staged file: {err}")))?;

        self.s3
            .put_object()
            .bucket(&bucket)
            .key(&req.object_key)
            .body(body)
            .send()
            .await
            .map_err(|err| classify_s3("export_to_object_store", err))?;

        drop(staged);
        Ok(ExportToObjectStoreResponse {
            rows_exported,
            size_bytes,
        })
    }
}

#[tonic::async_trait]
impl Analytics for AnalyticsService {
    async fn create_database(
        &self,
        request: Request<CreateDatabaseRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_database", &req.user_id, &req.organization_id)?;
        scope.annotate("database", req.database.as_str());
        let result = self.do_create_database(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_databases(
        &self,
        request: Request<ListDatabasesRequest>,
    ) -> std::result::Result<Response<ListDatabasesResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_databases", &req.user_id, &req.organization_id)?;
        let result = self.do_list_databases(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_table(
        &self,
        request: Request<CreateTableRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_table", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = self.do_create_table(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn execute_query(
        &self,
        request: Request<ExecuteQueryRequest>,
    ) -> std::result::Result<Response<ExecuteQueryResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("execute_query", &req.user_id, &req.organization_id)?;
        let result = self.do_execute_query(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn execute_statement(
        &self,
        request: Request<ExecuteStatementRequest>,
    ) -> std::result::Result<Response<ExecuteStatementResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("execute_statement", &req.user_id, &req.organization_id)?;
        let result = self.do_execute_statement(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn import_from_object_store(
        &self,
        request: Request<ImportFromObjectStoreRequest>,
    ) -> std::result::Result<Response<ImportFromObjectStoreResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin(
            "import_from_object_store",
            &req.user_id,
            &req.organization_id,
        )?;
        scope.annotate("table", req.table.as_str());
        scope.annotate("format", req.format.as_str());
        let result = self.do_import(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn export_to_object_store(
        &self,
        request: Request<ExportToObjectStoreRequest>,
    ) -> std::result::Result<Response<ExportToObjectStoreResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin(
            "export_to_object_store",
            &req.user_id,
            &req.organization_id,
        )?;
        scope.annotate("format", req.format.as_str());
        let result = self.do_export(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let probe = self
            .with_conn("health_check", |conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            })
            .await;
        let response = match probe {
            Ok(_) => HealthCheckResponse {
                healthy: true,
                status: "connected".to_string(),
            },
            Err(err) => HealthCheckResponse {
                healthy: false,
                status: err.to_string(),
            },
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_values_render_as_json() {
        assert_eq!(value_ref_to_json(ValueRef::Null), serde_json::Value::Null);
        assert_eq!(
            value_ref_to_json(ValueRef::Boolean(true)),
            serde_json::Value::Bool(true)
        );
        assert_eq!(
            value_ref_to_json(ValueRef::BigInt(42)),
            serde_json::Value::from(42)
        );
        assert_eq!(
            value_ref_to_json(ValueRef::Text(b"hello")),
            serde_json::Value::String("hello".to_string())
        );
        assert_eq!(
            value_ref_to_json(ValueRef::Blob(&[0xde, 0xad])),
            serde_json::Value::String("0xdead".to_string())
        );
    }

    #[test]
    fn params_parse_scalars_only() {
        let params = params_from_json(r#"[1, "a", true, null, 1.5]"#).unwrap();
        assert_eq!(params.len(), 5);
        assert!(matches!(params[0], duckdb::types::Value::BigInt(1)));
        assert!(matches!(params[4], duckdb::types::Value::Double(_)));

        assert!(params_from_json(r#"{"a":1}"#).is_err());
        assert!(params_from_json(r#"[[1]]"#).is_err());
        assert!(params_from_json("").unwrap().is_empty());
    }
}
