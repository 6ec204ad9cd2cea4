//! HTTP gateway: multiplexes JSON requests from non-gRPC clients into the
//! adapter fleet, with per-adapter circuit breaking, batch dispatch, an
//! admin surface, and Prometheus metrics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use serde_json::{json, Value};

mod breaker;
mod dispatch;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use dispatch::{AdapterClients, ADAPTERS};

const READY_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(clap::Parser, Debug)]
#[command(about = "HTTP gateway for the manifold service layer.")]
pub struct Args {
    /// Port for the HTTP surface.
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,
    /// Default per-request timeout in milliseconds.
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,
    /// Consecutive-failure threshold for the per-adapter breakers.
    #[arg(long, env = "BREAKER_FAILURE_THRESHOLD", default_value_t = 5)]
    pub breaker_failure_threshold: u32,

    #[arg(long, env = "MINIO_ADAPTER_URL", default_value = "http://127.0.0.1:50051")]
    pub minio_adapter_url: String,
    #[arg(long, env = "REDIS_ADAPTER_URL", default_value = "http://127.0.0.1:50052")]
    pub redis_adapter_url: String,
    #[arg(long, env = "NATS_ADAPTER_URL", default_value = "http://127.0.0.1:50053")]
    pub nats_adapter_url: String,
    #[arg(long, env = "QDRANT_ADAPTER_URL", default_value = "http://127.0.0.1:50054")]
    pub qdrant_adapter_url: String,
    #[arg(long, env = "NEO4J_ADAPTER_URL", default_value = "http://127.0.0.1:50055")]
    pub neo4j_adapter_url: String,
    #[arg(long, env = "DUCKDB_ADAPTER_URL", default_value = "http://127.0.0.1:50056")]
    pub duckdb_adapter_url: String,
    #[arg(long, env = "SUPABASE_ADAPTER_URL", default_value = "http://127.0.0.1:50057")]
    pub supabase_adapter_url: String,
    #[arg(long, env = "MQTT_ADAPTER_URL", default_value = "http://127.0.0.1:50058")]
    pub mqtt_adapter_url: String,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

pub struct App {
    clients: AdapterClients,
    breakers: Mutex<HashMap<&'static str, Arc<CircuitBreaker>>>,
    breaker_config: BreakerConfig,
    started: Instant,
    default_timeout: Duration,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    ready_cache: Mutex<Option<(Instant, bool, Value)>>,
}

impl App {
    fn new(args: &Args, clients: AdapterClients) -> Self {
        let breaker_config = BreakerConfig {
            consecutive_failures: args.breaker_failure_threshold,
            ..BreakerConfig::default()
        };
        let breakers = ADAPTERS
            .iter()
            .map(|adapter| (*adapter, Arc::new(CircuitBreaker::new(breaker_config.clone()))))
            .collect();
        Self {
            clients,
            breakers: Mutex::new(breakers),
            breaker_config,
            started: Instant::now(),
            default_timeout: Duration::from_millis(args.request_timeout_ms),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            ready_cache: Mutex::new(None),
        }
    }

    fn breaker(&self, adapter: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().unwrap().get(adapter).cloned()
    }

    fn reset_breakers(&self) {
        let mut map = self.breakers.lock().unwrap();
        for (_, breaker) in map.iter_mut() {
            *breaker = Arc::new(CircuitBreaker::new(self.breaker_config.clone()));
        }
    }

    fn breaker_states(&self) -> Value {
        let map = self.breakers.lock().unwrap();
        let mut out = serde_json::Map::new();
        for (adapter, breaker) in map.iter() {
            out.insert(adapter.to_string(), json!(breaker.state().as_str()));
        }
        Value::Object(out)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct InfraRequest {
    #[serde(default)]
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchItem>,
    #[serde(default)]
    pub parallel: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct BatchItem {
    pub adapter: String,
    #[serde(flatten)]
    pub request: InfraRequest,
}

fn http_status(code: tonic::Code) -> StatusCode {
    if code == tonic::Code::Unimplemented {
        return StatusCode::NOT_IMPLEMENTED;
    }
    StatusCode::from_u16(manifold_core::error::http_status_for_code(code))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Whether a failed call counts against the breaker; caller mistakes do
/// not.
fn counts_as_breaker_failure(code: tonic::Code) -> bool {
    matches!(
        code,
        tonic::Code::Unavailable
            | tonic::Code::Internal
            | tonic::Code::Unknown
            | tonic::Code::DeadlineExceeded
    )
}

struct CallOutcome {
    status: StatusCode,
    success: bool,
    data: Value,
    error: Option<String>,
    duration_ms: u64,
}

async fn call_adapter(app: &App, adapter: &str, request: &InfraRequest) -> CallOutcome {
    let started = Instant::now();
    app.requests_total.fetch_add(1, Ordering::Relaxed);

    let Some(breaker) = app.breaker(adapter) else {
        return CallOutcome {
            status: StatusCode::NOT_FOUND,
            success: false,
            data: Value::Null,
            error: Some(format!("unknown adapter '{adapter}'")),
            duration_ms: 0,
        };
    };

    if !breaker.try_acquire() {
        app.errors_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "errors_total",
            "adapter" => adapter.to_string(),
            "operation" => request.operation.clone(),
            "error_type" => "circuit_open",
        )
        .increment(1);
        return CallOutcome {
            status: StatusCode::SERVICE_UNAVAILABLE,
            success: false,
            data: Value::Null,
            error: Some(format!("circuit breaker open for '{adapter}'")),
            duration_ms: 0,
        };
    }

    metrics::gauge!("active_connections", "adapter" => adapter.to_string()).increment(1.0);
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(app.default_timeout);

    let result = tokio::time::timeout(
        timeout,
        dispatch::dispatch(
            &app.clients,
            adapter,
            &request.operation,
            &request.user_id,
            &request.organization_id,
            &request.params,
        ),
    )
    .await
    .unwrap_or_else(|_| {
        Err(tonic::Status::deadline_exceeded(format!(
            "no response within {}ms",
            timeout.as_millis()
        )))
    });
    metrics::gauge!("active_connections", "adapter" => adapter.to_string()).decrement(1.0);

    let duration = started.elapsed();
    metrics::histogram!(
        "request_duration_seconds",
        "adapter" => adapter.to_string(),
        "operation" => request.operation.clone(),
    )
    .record(duration.as_secs_f64());

    match result {
        Ok(data) => {
            breaker.on_success();
            metrics::counter!(
                "requests_total",
                "adapter" => adapter.to_string(),
                "operation" => request.operation.clone(),
                "status" => "ok",
            )
            .increment(1);
            CallOutcome {
                status: StatusCode::OK,
                success: true,
                data,
                error: None,
                duration_ms: duration.as_millis() as u64,
            }
        }
        Err(status) => {
            if counts_as_breaker_failure(status.code()) {
                breaker.on_failure();
            } else {
                breaker.on_success();
            }
            app.errors_total.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "requests_total",
                "adapter" => adapter.to_string(),
                "operation" => request.operation.clone(),
                "status" => "error",
            )
            .increment(1);
            metrics::counter!(
                "errors_total",
                "adapter" => adapter.to_string(),
                "operation" => request.operation.clone(),
                "error_type" => format!("{:?}", status.code()),
            )
            .increment(1);
            CallOutcome {
                status: http_status(status.code()),
                success: false,
                data: Value::Null,
                error: Some(status.message().to_string()),
                duration_ms: duration.as_millis() as u64,
            }
        }
    }
}

fn outcome_body(
    adapter: &str,
    request_id: &str,
    operation: &str,
    outcome: &CallOutcome,
) -> Value {
    let mut body = json!({
        "success": outcome.success,
        "request_id": request_id,
        "adapter": adapter,
        "operation": operation,
        "duration_ms": outcome.duration_ms,
    });
    if outcome.success {
        body["data"] = outcome.data.clone();
    } else {
        body["error"] = json!(outcome.error.clone().unwrap_or_default());
    }
    body
}

async fn infra_handler(
    State(app): State<Arc<App>>,
    Path(adapter): Path<String>,
    Json(request): Json<InfraRequest>,
) -> Response {
    let request_id = request
        .request_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = call_adapter(&app, &adapter, &request).await;
    let body = outcome_body(&adapter, &request_id, &request.operation, &outcome);
    (outcome.status, Json(body)).into_response()
}

async fn batch_handler(
    State(app): State<Arc<App>>,
    Json(batch): Json<BatchRequest>,
) -> Response {
    if batch.requests.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "requests is required" })),
        )
            .into_response();
    }

    let started = Instant::now();
    let mut results = Vec::with_capacity(batch.requests.len());

    if batch.parallel {
        let futures = batch.requests.iter().map(|item| {
            let app = Arc::clone(&app);
            async move {
                let outcome = call_adapter(&app, &item.adapter, &item.request).await;
                let request_id = item
                    .request
                    .request_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                outcome_body(&item.adapter, &request_id, &item.request.operation, &outcome)
            }
        });
        results = futures::future::join_all(futures).await;
    } else {
        for item in &batch.requests {
            let outcome = call_adapter(&app, &item.adapter, &item.request).await;
            let request_id = item
                .request
                .request_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            results.push(outcome_body(
                &item.adapter,
                &request_id,
                &item.request.operation,
                &outcome,
            ));
        }
    }

    let success = results
        .iter()
        .all(|r| r.get("success").and_then(Value::as_bool).unwrap_or(false));
    let body = json!({
        "success": success,
        "parallel": batch.parallel,
        "duration_ms": started.elapsed().as_millis() as u64,
        "results": results,
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "manifold-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn readiness(app: &App) -> (bool, Value) {
    {
        let cache = app.ready_cache.lock().unwrap();
        if let Some((at, ready, body)) = cache.as_ref() {
            if at.elapsed() < READY_CACHE_TTL {
                metrics::counter!("cache_hits_total", "cache" => "readiness").increment(1);
                return (*ready, body.clone());
            }
        }
    }

    let probes = ADAPTERS.iter().map(|adapter| {
        let clients = app.clients.clone();
        async move {
            let (healthy, status) = clients.health(adapter).await;
            (*adapter, healthy, status)
        }
    });
    let outcomes = futures::future::join_all(probes).await;

    let ready = outcomes.iter().all(|(_, healthy, _)| *healthy);
    let mut adapters = serde_json::Map::new();
    for (adapter, healthy, status) in outcomes {
        adapters.insert(
            adapter.to_string(),
            json!({ "healthy": healthy, "status": status }),
        );
    }
    let body = json!({ "ready": ready, "adapters": adapters });

    *app.ready_cache.lock().unwrap() = Some((Instant::now(), ready, body.clone()));
    (ready, body)
}

async fn ready_handler(State(app): State<Arc<App>>) -> Response {
    let (ready, body) = readiness(&app).await;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn stats_handler(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!({
        "uptime_seconds": app.started.elapsed().as_secs(),
        "requests_total": app.requests_total.load(Ordering::Relaxed),
        "errors_total": app.errors_total.load(Ordering::Relaxed),
        "breakers": app.breaker_states(),
    }))
}

async fn connections_handler(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!({
        "adapters": ADAPTERS,
        "breakers": app.breaker_states(),
    }))
}

async fn health_detailed_handler(State(app): State<Arc<App>>) -> Response {
    let (ready, readiness_body) = readiness(&app).await;
    let body = json!({
        "ready": ready,
        "uptime_seconds": app.started.elapsed().as_secs(),
        "requests_total": app.requests_total.load(Ordering::Relaxed),
        "errors_total": app.errors_total.load(Ordering::Relaxed),
        "breakers": app.breaker_states(),
        "readiness": readiness_body,
    });
    (StatusCode::OK, Json(body)).into_response()
}

async fn flush_cache_handler(State(app): State<Arc<App>>) -> Json<Value> {
    *app.ready_cache.lock().unwrap() = None;
    Json(json!({ "flushed": true }))
}

async fn reload_config_handler(State(app): State<Arc<App>>) -> Json<Value> {
    app.reset_breakers();
    *app.ready_cache.lock().unwrap() = None;
    tracing::info!("gateway runtime state reloaded");
    Json(json!({ "reloaded": true }))
}

async fn request_id_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    request.extensions_mut().insert(id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

pub fn build_router(app: Arc<App>) -> axum::Router {
    axum::Router::new()
        .route("/api/v1/infra/batch", post(batch_handler))
        .route("/api/v1/infra/:adapter", post(infra_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/admin/stats", get(stats_handler))
        .route("/admin/connections", get(connections_handler))
        .route("/admin/health-detailed", get(health_detailed_handler))
        .route("/admin/flush-cache", post(flush_cache_handler))
        .route("/admin/reload-config", post(reload_config_handler))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(tower_http::cors::CorsLayer::very_permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let runtime = manifold_core::serve::AdapterRuntime::start(
        "gateway",
        &args.service,
        &args.consul,
        &args.audit,
        &["dispatch", "batch"],
    )
    .await?;

    let clients = AdapterClients::connect(&args)?;
    let app = Arc::new(App::new(&args, clients));
    let router = build_router(app);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.http_port))
        .await
        .context("binding HTTP port")?;
    tracing::info!(port = args.http_port, "gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(manifold_core::serve::shutdown_signal())
        .await
        .context("serving HTTP")?;

    runtime.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infra_requests_deserialize_with_defaults() {
        let request: InfraRequest = serde_json::from_str(
            r#"{"operation":"get","params":{"key":"a"},"user_id":"alice"}"#,
        )
        .unwrap();
        assert_eq!(request.operation, "get");
        assert_eq!(request.user_id, "alice");
        assert!(request.request_id.is_none());
        assert!(request.timeout_ms.is_none());
        assert!(request.service.is_empty());
    }

    #[test]
    fn batch_items_flatten_the_request_body() {
        let batch: BatchRequest = serde_json::from_str(
            r#"{"parallel":true,"requests":[
                {"adapter":"redis","operation":"get","params":{"key":"a"},"user_id":"alice"},
                {"adapter":"minio","operation":"list_buckets","params":{},"user_id":"alice"}
            ]}"#,
        )
        .unwrap();
        assert!(batch.parallel);
        assert_eq!(batch.requests.len(), 2);
        assert_eq!(batch.requests[0].adapter, "redis");
        assert_eq!(batch.requests[1].request.operation, "list_buckets");
    }

    #[test]
    fn breaker_failures_exclude_caller_errors() {
        assert!(counts_as_breaker_failure(tonic::Code::Unavailable));
        assert!(counts_as_breaker_failure(tonic::Code::DeadlineExceeded));
        assert!(!counts_as_breaker_failure(tonic::Code::NotFound));
        assert!(!counts_as_breaker_failure(tonic::Code::InvalidArgument));
        assert!(!counts_as_breaker_failure(tonic::Code::PermissionDenied));
    }

    #[test]
    fn grpc_codes_map_to_http_statuses() {
        assert_eq!(http_status(tonic::Code::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            http_status(tonic::Code::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            http_status(tonic::Code::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            http_status(tonic::Code::Unimplemented),
            StatusCode::NOT_IMPLEMENTED
        );
    }
}
