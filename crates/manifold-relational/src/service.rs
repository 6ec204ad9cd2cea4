//! The relational/vector-database gRPC service.
//!
//! Transactions are tracked in a registry keyed by `transaction_id`; an
//! expired transaction is dropped, which rolls it back on the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use manifold_core::{AdapterContext, Error, Result};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use proto_manifold::relational::relational_server::Relational;
use proto_manifold::relational::{
    BatchInsertRequest, BatchUpsertEmbeddingsRequest, BeginTransactionRequest,
    BeginTransactionResponse, CommitTransactionRequest, DeleteEmbeddingRequest, DeleteRequest,
    EmbeddingMatch, EmbeddingSearchResponse, ExecuteRpcRequest, ExecuteRpcResponse,
    HybridSearchRequest, InsertRequest, MutationResponse, QueryRequest, QueryResponse,
    RollbackTransactionRequest, SimilaritySearchRequest, UpdateRequest, UpsertEmbeddingRequest,
    UpsertRequest,
};
use sqlx::postgres::PgArguments;
use sqlx::{PgPool, Postgres, Row};
use tonic::{Request, Response, Status};

use crate::sqlgen::{self, Built, SqlParam, CONTENT_COLUMN, OWNER_COLUMN};

type Tx = sqlx::Transaction<'static, Postgres>;

pub struct RelationalService {
    ctx: AdapterContext,
    pool: PgPool,
    transactions: Arc<Mutex<HashMap<String, (Tx, Instant)>>>,
    tx_timeout: Duration,
}

fn classify(context: &str, err: sqlx::Error) -> Error {
    let detail = format!("{context}: {err}");
    match &err {
        sqlx::Error::RowNotFound => Error::NotFound(detail),
        sqlx::Error::PoolTimedOut => Error::Unavailable(detail),
        sqlx::Error::Io(_) => Error::Unavailable(detail),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            match code.as_str() {
                "23505" => Error::AlreadyExists(detail),
                "42P01" | "42883" => Error::NotFound(detail),
                "57014" => Error::DeadlineExceeded(detail),
                "28000" | "28P01" | "42501" => Error::PermissionDenied(detail),
                code if code.starts_with("23") => Error::FailedPrecondition(detail),
                code if code.starts_with("42") || code.starts_with("22") => {
                    Error::InvalidArgument(detail)
                }
                code if code.starts_with("53") => Error::ResourceExhausted(detail),
                _ => Error::Internal(detail),
            }
        }
        _ => Error::Internal(detail),
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [SqlParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(s) => query.bind(s.as_str()),
            SqlParam::Int(i) => query.bind(*i),
            SqlParam::Float(f) => query.bind(*f),
            SqlParam::Bool(b) => query.bind(*b),
        };
    }
    query
}

impl RelationalService {
    pub fn new(ctx: AdapterContext, pool: PgPool, tx_timeout: Duration) -> Self {
        let transactions: Arc<Mutex<HashMap<String, (Tx, Instant)>>> =
            Arc::new(Mutex::new(HashMap::new()));

        // Reap expired transactions; dropping one rolls it back.
        let reaper_map = Arc::clone(&transactions);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let mut expired = Vec::new();
                {
                    let mut map = reaper_map.lock().unwrap();
                    let before = map.len();
                    map.retain(|id, (_, started)| {
                        let keep = started.elapsed() < tx_timeout;
                        if !keep {
                            expired.push(id.clone());
                        }
                        keep
                    });
                    if map.len() != before {
                        tracing::info!(expired = ?expired, "rolled back expired transactions");
                    }
                }
            }
        });

        Self {
            ctx,
            pool,
            transactions,
            tx_timeout,
        }
    }

    fn take_tx(&self, transaction_id: &str) -> Result<Tx> {
        let mut map = self.transactions.lock().unwrap();
        match map.remove(transaction_id) {
            Some((tx, started)) if started.elapsed() < self.tx_timeout => Ok(tx),
            Some(_) => Err(Error::FailedPrecondition(format!(
                "transaction '{transaction_id}' has expired"
            ))),
            None => Err(Error::NotFound(format!(
                "transaction '{transaction_id}' not found"
            ))),
        }
    }

    fn restore_tx(&self, transaction_id: &str, tx: Tx, started: Instant) {
        self.transactions
            .lock()
            .unwrap()
            .insert(transaction_id.to_string(), (tx, started));
    }

    /// Execute a mutation, either on the pool or inside a registered
    /// transaction. A statement error inside a transaction aborts it.
    async fn execute_built(
        &self,
        context: &'static str,
        built: Built,
        transaction_id: &str,
    ) -> Result<u64> {
        if transaction_id.is_empty() {
            let result = bind_params(sqlx::query(&built.sql), &built.params)
                .execute(&self.pool)
                .await
                .map_err(|err| classify(context, err))?;
            return Ok(result.rows_affected());
        }

        let mut tx = self.take_tx(transaction_id)?;
        let started = Instant::now();
        match bind_params(sqlx::query(&built.sql), &built.params)
            .execute(&mut tx)
            .await
        {
            Ok(result) => {
                self.restore_tx(transaction_id, tx, started);
                Ok(result.rows_affected())
            }
            Err(err) => {
                // The transaction is aborted on the backend; drop it so the
                // rollback happens now rather than at expiry.
                drop(tx);
                Err(classify(context, err))
            }
        }
    }

    /// Run a SELECT and return its rows as a JSON array, aggregated
    /// backend-side.
    async fn fetch_json(
        &self,
        context: &'static str,
        built: Built,
        transaction_id: &str,
    ) -> Result<String> {
        let wrapped = format!(
            "SELECT COALESCE(json_agg(t), '[]'::json)::text FROM ({}) AS t",
            built.sql,
        );

        if transaction_id.is_empty() {
            let row = bind_params(sqlx::query(&wrapped), &built.params)
                .fetch_one(&self.pool)
                .await
                .map_err(|err| classify(context, err))?;
            return row
                .try_get::<String, _>(0)
                .map_err(|err| classify(context, err));
        }

        let mut tx = self.take_tx(transaction_id)?;
        let started = Instant::now();
        match bind_params(sqlx::query(&wrapped), &built.params)
            .fetch_one(&mut tx)
            .await
        {
            Ok(row) => {
                let value = row
                    .try_get::<String, _>(0)
                    .map_err(|err| classify(context, err));
                self.restore_tx(transaction_id, tx, started);
                value
            }
            Err(err) => {
                drop(tx);
                Err(classify(context, err))
            }
        }
    }

    async fn do_query(&self, req: QueryRequest) -> Result<QueryResponse> {
        let built = sqlgen::build_select(
            &req.user_id,
            &req.table,
            &req.filter_json,
            &req.columns,
            &req.order_by,
            req.limit,
            req.offset,
        )?;
        let rows_json = self.fetch_json("query", built, &req.transaction_id).await?;
        let row_count = serde_json::from_str::<serde_json::Value>(&rows_json)
            .ok()
            .and_then(|v| v.as_array().map(|a| a.len() as i64))
            .unwrap_or_default();
        Ok(QueryResponse {
            rows_json,
            row_count,
        })
    }

    async fn do_execute_rpc(&self, req: ExecuteRpcRequest) -> Result<ExecuteRpcResponse> {
        let function = sqlgen::identifier(&req.function)?;

        let mut params = Vec::new();
        let mut arg_fragments = Vec::new();
        if !req.args_json.is_empty() {
            let value: serde_json::Value = serde_json::from_str(&req.args_json)
                .map_err(|err| Error::InvalidArgument(format!("invalid args: {err}")))?;
            let serde_json::Value::Object(args) = value else {
                return Err(Error::InvalidArgument(
                    "args must be a JSON object".to_string(),
                ));
            };
            for (name, arg) in &args {
                sqlgen::identifier(name)?;
                match arg {
                    serde_json::Value::String(s) => params.push(SqlParam::Text(s.clone())),
                    serde_json::Value::Bool(b) => params.push(SqlParam::Bool(*b)),
                    serde_json::Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            params.push(SqlParam::Int(i));
                        } else {
                            params.push(SqlParam::Float(n.as_f64().unwrap_or_default()));
                        }
                    }
                    other => {
                        return Err(Error::InvalidArgument(format!(
                            "unsupported argument '{name}': {other}"
                        )))
                    }
                }
                arg_fragments.push(format!("{name} := ${}", params.len()));
            }
        }

        let built = Built {
            sql: format!("SELECT * FROM {function}({})", arg_fragments.join(", ")),
            params,
        };
        let result_json = self.fetch_json("execute_rpc", built, "").await?;
        Ok(ExecuteRpcResponse { result_json })
    }

    async fn do_upsert_embedding(&self, req: UpsertEmbeddingRequest) -> Result<Ack> {
        let table = sqlgen::identifier(&req.table)?;
        if req.id.is_empty() {
            return Err(Error::InvalidArgument("id is required".to_string()));
        }
        if req.vector.is_empty() {
            return Err(Error::InvalidArgument("vector is required".to_string()));
        }
        let metadata = if req.metadata_json.is_empty() {
            "{}".to_string()
        } else {
            serde_json::from_str::<serde_json::Value>(&req.metadata_json)
                .map_err(|err| Error::InvalidArgument(format!("invalid metadata: {err}")))?;
            req.metadata_json.clone()
        };

        let built = Built {
            sql: format!(
                "INSERT INTO {table} (id, {OWNER_COLUMN}, embedding, metadata) \
                 VALUES ($1, $2, $3::vector, $4::jsonb) \
                 ON CONFLICT ({OWNER_COLUMN}, id) DO UPDATE SET \
                   embedding = EXCLUDED.embedding, metadata = EXCLUDED.metadata"
            ),
            params: vec![
                SqlParam::Text(req.id.clone()),
                SqlParam::Text(req.user_id.clone()),
                SqlParam::Text(sqlgen::vector_literal(&req.vector)),
                SqlParam::Text(metadata),
            ],
        };
        self.execute_built("upsert_embedding", built, "").await?;
        Ok(Ack {})
    }

    async fn do_batch_upsert_embeddings(
        &self,
        req: BatchUpsertEmbeddingsRequest,
    ) -> Result<MutationResponse> {
        let table = sqlgen::identifier(&req.table)?;
        if req.embeddings.is_empty() {
            return Err(Error::InvalidArgument("embeddings is required".to_string()));
        }

        let mut params = Vec::new();
        let mut tuples = Vec::with_capacity(req.embeddings.len());
        for embedding in &req.embeddings {
            if embedding.id.is_empty() || embedding.vector.is_empty() {
                return Err(Error::InvalidArgument(
                    "every embedding needs an id and a vector".to_string(),
                ));
            }
            let metadata = if embedding.metadata_json.is_empty() {
                "{}".to_string()
            } else {
                embedding.metadata_json.clone()
            };
            params.push(SqlParam::Text(embedding.id.clone()));
            let id_n = params.len();
            params.push(SqlParam::Text(req.user_id.clone()));
            let owner_n = params.len();
            params.push(SqlParam::Text(sqlgen::vector_literal(&embedding.vector)));
            let vec_n = params.len();
            params.push(SqlParam::Text(metadata));
            let meta_n = params.len();
            tuples.push(format!(
                "(${id_n}, ${owner_n}, ${vec_n}::vector, ${meta_n}::jsonb)"
            ));
        }

        let built = Built {
            sql: format!(
                "INSERT INTO {table} (id, {OWNER_COLUMN}, embedding, metadata) VALUES {} \
                 ON CONFLICT ({OWNER_COLUMN}, id) DO UPDATE SET \
                   embedding = EXCLUDED.embedding, metadata = EXCLUDED.metadata",
                tuples.join(", "),
            ),
            params,
        };
        let rows_affected = self
            .execute_built("batch_upsert_embeddings", built, "")
            .await?;
        Ok(MutationResponse {
            rows_affected: rows_affected as i64,
        })
    }

    fn metadata_filter(
        filter_json: &str,
        params: &mut Vec<SqlParam>,
    ) -> Result<String> {
        if filter_json.is_empty() {
            return Ok(String::new());
        }
        let value: serde_json::Value = serde_json::from_str(filter_json)
            .map_err(|err| Error::InvalidArgument(format!("invalid filter: {err}")))?;
        let serde_json::Value::Object(filters) = value else {
            return Err(Error::InvalidArgument(
                "filter must be a JSON object".to_string(),
            ));
        };
        let mut fragments = String::new();
        for (key, value) in &filters {
            sqlgen::identifier(key)?;
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.push(SqlParam::Text(text));
            fragments.push_str(&format!(" AND metadata->>'{key}' = ${}", params.len()));
        }
        Ok(fragments)
    }

    async fn do_similarity_search(
        &self,
        req: SimilaritySearchRequest,
    ) -> Result<EmbeddingSearchResponse> {
        let table = sqlgen::identifier(&req.table)?;
        if req.query_vector.is_empty() {
            return Err(Error::InvalidArgument("query_vector is required".to_string()));
        }
        let limit = if req.limit <= 0 { 10 } else { req.limit.min(1000) };

        let mut params = vec![
            SqlParam::Text(sqlgen::vector_literal(&req.query_vector)),
            SqlParam::Text(req.user_id.clone()),
        ];
        let mut conditions = format!("{OWNER_COLUMN} = $2");
        conditions.push_str(&Self::metadata_filter(&req.filter_json, &mut params)?);
        if req.threshold > 0.0 {
            params.push(SqlParam::Float(f64::from(req.threshold)));
            conditions.push_str(&format!(
                " AND (1 - (embedding <=> $1::vector)) >= ${}",
                params.len()
            ));
        }

        let sql = format!(
            "SELECT id::text AS id, COALESCE(metadata::text, '{{}}') AS metadata, \
                    (1 - (embedding <=> $1::vector))::float8 AS score \
             FROM {table} WHERE {conditions} \
             ORDER BY embedding <=> $1::vector LIMIT {limit}"
        );

        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify("similarity_search", err))?;

        let matches = rows
            .iter()
            .map(|row| {
                Ok(EmbeddingMatch {
                    id: row
                        .try_get::<String, _>("id")
                        .map_err(|err| classify("similarity_search", err))?,
                    score: row
                        .try_get::<f64, _>("score")
                        .map_err(|err| classify("similarity_search", err))?
                        as f32,
                    metadata_json: row
                        .try_get::<String, _>("metadata")
                        .map_err(|err| classify("similarity_search", err))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EmbeddingSearchResponse { matches })
    }

    async fn do_hybrid_search(&self, req: HybridSearchRequest) -> Result<EmbeddingSearchResponse> {
        let table = sqlgen::identifier(&req.table)?;
        if req.text_query.is_empty() && req.vector_query.is_empty() {
            return Err(Error::InvalidArgument(
                "text_query or vector_query is required".to_string(),
            ));
        }
        let limit = if req.limit <= 0 { 10 } else { req.limit.min(1000) };
        let (text_weight, vector_weight) = if req.text_weight <= 0.0 && req.vector_weight <= 0.0 {
            (0.5_f64, 0.5_f64)
        } else {
            (f64::from(req.text_weight), f64::from(req.vector_weight))
        };

        let params = vec![
            SqlParam::Text(req.text_query.clone()),
            SqlParam::Text(sqlgen::vector_literal(&req.vector_query)),
            SqlParam::Float(text_weight),
            SqlParam::Float(vector_weight),
            SqlParam::Text(req.user_id.clone()),
        ];
        let sql = format!(
            "SELECT id::text AS id, COALESCE(metadata::text, '{{}}') AS metadata, \
                    ($3::float8 * ts_rank_cd(to_tsvector('english', COALESCE({CONTENT_COLUMN}, '')), \
                                             plainto_tsquery('english', $1)) \
                     + $4::float8 * (1 - (embedding <=> $2::vector)))::float8 AS score \
             FROM {table} WHERE {OWNER_COLUMN} = $5 \
             ORDER BY score DESC LIMIT {limit}"
        );

        let rows = bind_params(sqlx::query(&sql), &params)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| classify("hybrid_search", err))?;

        let matches = rows
            .iter()
            .map(|row| {
                Ok(EmbeddingMatch {
                    id: row
                        .try_get::<String, _>("id")
                        .map_err(|err| classify("hybrid_search", err))?,
                    score: row
                        .try_get::<f64, _>("score")
                        .map_err(|err| classify("hybrid_search", err))? as f32,
                    metadata_json: row
                        .try_get::<String, _>("metadata")
                        .map_err(|err| classify("hybrid_search", err))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EmbeddingSearchResponse { matches })
    }
}

#[tonic::async_trait]
impl Relational for RelationalService {
    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> std::result::Result<Response<QueryResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("query", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = self.do_query(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn insert(
        &self,
        request: Request<InsertRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("insert", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let built = sqlgen::build_insert(&req.user_id, &req.table, &req.rows_json)?;
            let rows_affected = self
                .execute_built("insert", built, &req.transaction_id)
                .await?;
            Ok(MutationResponse {
                rows_affected: rows_affected as i64,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("update", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let built =
                sqlgen::build_update(&req.user_id, &req.table, &req.set_json, &req.filter_json)?;
            let rows_affected = self
                .execute_built("update", built, &req.transaction_id)
                .await?;
            Ok(MutationResponse {
                rows_affected: rows_affected as i64,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("delete", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let built = sqlgen::build_delete(&req.user_id, &req.table, &req.filter_json)?;
            let rows_affected = self
                .execute_built("delete", built, &req.transaction_id)
                .await?;
            Ok(MutationResponse {
                rows_affected: rows_affected as i64,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn upsert(
        &self,
        request: Request<UpsertRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("upsert", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let built = sqlgen::build_upsert(
                &req.user_id,
                &req.table,
                &req.rows_json,
                &req.conflict_columns,
            )?;
            let rows_affected = self
                .execute_built("upsert", built, &req.transaction_id)
                .await?;
            Ok(MutationResponse {
                rows_affected: rows_affected as i64,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn execute_rpc(
        &self,
        request: Request<ExecuteRpcRequest>,
    ) -> std::result::Result<Response<ExecuteRpcResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("execute_rpc", &req.user_id, &req.organization_id)?;
        scope.annotate("function", req.function.as_str());
        let result = self.do_execute_rpc(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn batch_insert(
        &self,
        request: Request<BatchInsertRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("batch_insert", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let built = sqlgen::build_insert(&req.user_id, &req.table, &req.rows_json)?;
            let rows_affected = self.execute_built("batch_insert", built, "").await?;
            Ok(MutationResponse {
                rows_affected: rows_affected as i64,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn upsert_embedding(
        &self,
        request: Request<UpsertEmbeddingRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("upsert_embedding", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = self.do_upsert_embedding(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn batch_upsert_embeddings(
        &self,
        request: Request<BatchUpsertEmbeddingsRequest>,
    ) -> std::result::Result<Response<MutationResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin(
            "batch_upsert_embeddings",
            &req.user_id,
            &req.organization_id,
        )?;
        scope.annotate("embeddings", req.embeddings.len().to_string());
        let result = self.do_batch_upsert_embeddings(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn similarity_search(
        &self,
        request: Request<SimilaritySearchRequest>,
    ) -> std::result::Result<Response<EmbeddingSearchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("similarity_search", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = self.do_similarity_search(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn hybrid_search(
        &self,
        request: Request<HybridSearchRequest>,
    ) -> std::result::Result<Response<EmbeddingSearchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("hybrid_search", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = self.do_hybrid_search(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_embedding(
        &self,
        request: Request<DeleteEmbeddingRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_embedding", &req.user_id, &req.organization_id)?;
        scope.annotate("table", req.table.as_str());
        let result = async {
            let table = sqlgen::identifier(&req.table)?;
            if req.id.is_empty() {
                return Err(Error::InvalidArgument("id is required".to_string()));
            }
            let built = Built {
                sql: format!("DELETE FROM {table} WHERE {OWNER_COLUMN} = $1 AND id = $2"),
                params: vec![
                    SqlParam::Text(req.user_id.clone()),
                    SqlParam::Text(req.id.clone()),
                ],
            };
            let rows_affected = self.execute_built("delete_embedding", built, "").await?;
            if rows_affected == 0 {
                return Err(Error::NotFound(format!("embedding '{}' not found", req.id)));
            }
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn begin_transaction(
        &self,
        request: Request<BeginTransactionRequest>,
    ) -> std::result::Result<Response<BeginTransactionResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("begin_transaction", &req.user_id, &req.organization_id)?;
        let result = async {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|err| classify("begin_transaction", err))?;
            let transaction_id = uuid::Uuid::new_v4().to_string();
            self.transactions
                .lock()
                .unwrap()
                .insert(transaction_id.clone(), (tx, Instant::now()));
            Ok(BeginTransactionResponse { transaction_id })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn commit_transaction(
        &self,
        request: Request<CommitTransactionRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("commit_transaction", &req.user_id, &req.organization_id)?;
        scope.annotate("transaction", req.transaction_id.as_str());
        let result = async {
            let tx = self.take_tx(&req.transaction_id)?;
            tx.commit()
                .await
                .map_err(|err| classify("commit_transaction", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn rollback_transaction(
        &self,
        request: Request<RollbackTransactionRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("rollback_transaction", &req.user_id, &req.organization_id)?;
        scope.annotate("transaction", req.transaction_id.as_str());
        let result = async {
            let tx = self.take_tx(&req.transaction_id)?;
            tx.rollback()
                .await
                .map_err(|err| classify("rollback_transaction", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let response = match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => HealthCheckResponse {
                healthy: true,
                status: "connected".to_string(),
            },
            Err(err) => HealthCheckResponse {
                healthy: false,
                status: classify("health_check", err).to_string(),
            },
        };
        Ok(Response::new(response))
    }
}
