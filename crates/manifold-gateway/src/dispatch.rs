//! HTTP-to-gRPC dispatch.
//!
//! Each inbound `{ operation, params }` pair is translated into one typed
//! call on the adapter's gRPC client. The gateway intentionally exposes
//! the high-traffic operations; gRPC remains the full-fidelity surface.

use proto_manifold::analytics::analytics_client::AnalyticsClient;
use proto_manifold::broker::broker_client::BrokerClient;
use proto_manifold::cache::cache_client::CacheClient;
use proto_manifold::common::HealthCheckRequest;
use proto_manifold::graph::graph_client::GraphClient;
use proto_manifold::mqtt::mqtt_client::MqttClient;
use proto_manifold::objectstore::object_store_client::ObjectStoreClient;
use proto_manifold::relational::relational_client::RelationalClient;
use proto_manifold::vector::vector_search_client::VectorSearchClient;
use proto_manifold::{analytics, broker, cache, graph, mqtt, objectstore, relational, vector};
use serde_json::{json, Value};
use tonic::transport::Channel;
use tonic::Status;

/// Adapters the gateway can route to, by path segment.
pub const ADAPTERS: &[&str] = &[
    "minio", "nats", "redis", "qdrant", "neo4j", "duckdb", "supabase", "mqtt",
];

#[derive(Clone)]
pub struct AdapterClients {
    pub objectstore: ObjectStoreClient<Channel>,
    pub broker: BrokerClient<Channel>,
    pub cache: CacheClient<Channel>,
    pub vector: VectorSearchClient<Channel>,
    pub graph: GraphClient<Channel>,
    pub analytics: AnalyticsClient<Channel>,
    pub relational: RelationalClient<Channel>,
    pub mqtt: MqttClient<Channel>,
}

fn lazy_channel(url: &str) -> anyhow::Result<Channel> {
    Ok(tonic::transport::Endpoint::from_shared(url.to_string())?.connect_lazy())
}

impl AdapterClients {
    pub fn connect(args: &crate::Args) -> anyhow::Result<Self> {
        Ok(Self {
            objectstore: ObjectStoreClient::new(lazy_channel(&args.minio_adapter_url)?),
            broker: BrokerClient::new(lazy_channel(&args.nats_adapter_url)?),
            cache: CacheClient::new(lazy_channel(&args.redis_adapter_url)?),
            vector: VectorSearchClient::new(lazy_channel(&args.qdrant_adapter_url)?),
            graph: GraphClient::new(lazy_channel(&args.neo4j_adapter_url)?),
            analytics: AnalyticsClient::new(lazy_channel(&args.duckdb_adapter_url)?),
            relational: RelationalClient::new(lazy_channel(&args.supabase_adapter_url)?),
            mqtt: MqttClient::new(lazy_channel(&args.mqtt_adapter_url)?),
        })
    }

    /// Probe one adapter's HealthCheck; `(healthy, status)`.
    pub async fn health(&self, adapter: &str) -> (bool, String) {
        let result = match adapter {
            "minio" => self
                .objectstore
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "nats" => self
                .broker
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "redis" => self
                .cache
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "qdrant" => self
                .vector
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "neo4j" => self
                .graph
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "duckdb" => self
                .analytics
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "supabase" => self
                .relational
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            "mqtt" => self
                .mqtt
                .clone()
                .health_check(HealthCheckRequest {})
                .await
                .map(|r| r.into_inner()),
            other => return (false, format!("unknown adapter '{other}'")),
        };
        match result {
            Ok(health) => (health.healthy, health.status),
            Err(status) => (false, status.message().to_string()),
        }
    }
}

fn str_field(params: &Value, field: &str) -> String {
    params
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn i64_field(params: &Value, field: &str) -> i64 {
    params.get(field).and_then(Value::as_i64).unwrap_or_default()
}

fn bool_field(params: &Value, field: &str) -> bool {
    params.get(field).and_then(Value::as_bool).unwrap_or_default()
}

fn bytes_field(params: &Value, field: &str) -> Vec<u8> {
    str_field(params, field).into_bytes()
}

fn vector_field(params: &Value, field: &str) -> Vec<f32> {
    params
        .get(field)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect()
        })
        .unwrap_or_default()
}

fn json_field(params: &Value, field: &str) -> String {
    match params.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn unknown(adapter: &str, operation: &str) -> Status {
    Status::unimplemented(format!(
        "operation '{operation}' is not exposed for '{adapter}' over the gateway"
    ))
}

/// Route one request. Returns the response payload as JSON.
pub async fn dispatch(
    clients: &AdapterClients,
    adapter: &str,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    match adapter {
        "minio" => dispatch_objectstore(clients, operation, user_id, organization_id, params).await,
        "nats" => dispatch_broker(clients, operation, user_id, organization_id, params).await,
        "redis" => dispatch_cache(clients, operation, user_id, organization_id, params).await,
        "qdrant" => dispatch_vector(clients, operation, user_id, organization_id, params).await,
        "neo4j" => dispatch_graph(clients, operation, user_id, organization_id, params).await,
        "duckdb" => dispatch_analytics(clients, operation, user_id, organization_id, params).await,
        "supabase" => dispatch_relational(clients, operation, user_id, organization_id, params).await,
        "mqtt" => dispatch_mqtt(clients, operation, user_id, organization_id, params).await,
        other => Err(Status::not_found(format!("unknown adapter '{other}'"))),
    }
}

async fn dispatch_objectstore(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.objectstore.clone();
    match operation {
        "create_bucket" => {
            let response = client
                .create_bucket(objectstore::CreateBucketRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    region: str_field(params, "region"),
                    tags: Default::default(),
                })
                .await?
                .into_inner();
            Ok(json!({ "bucket": response.logical_name, "region": response.region }))
        }
        "list_buckets" => {
            let response = client
                .list_buckets(objectstore::ListBucketsRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    prefix: str_field(params, "prefix"),
                })
                .await?
                .into_inner();
            let buckets: Vec<Value> = response
                .buckets
                .iter()
                .map(|b| json!({ "name": b.logical_name, "creation_time": b.creation_time }))
                .collect();
            Ok(json!({ "buckets": buckets }))
        }
        "delete_bucket" => {
            let response = client
                .delete_bucket(objectstore::DeleteBucketRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    force: bool_field(params, "force"),
                })
                .await?
                .into_inner();
            Ok(json!({ "deleted_object_count": response.deleted_object_count }))
        }
        "list_objects" => {
            let response = client
                .list_objects(objectstore::ListObjectsRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    prefix: str_field(params, "prefix"),
                    max_keys: i64_field(params, "max_keys") as i32,
                    recursive: bool_field(params, "recursive"),
                })
                .await?
                .into_inner();
            let objects: Vec<Value> = response
                .objects
                .iter()
                .map(|o| {
                    json!({
                        "key": o.object_key,
                        "size": o.size,
                        "etag": o.etag,
                        "is_prefix": o.is_prefix,
                    })
                })
                .collect();
            Ok(json!({ "objects": objects, "is_truncated": response.is_truncated }))
        }
        "stat_object" => {
            let response = client
                .stat_object(objectstore::StatObjectRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    object_key: str_field(params, "key"),
                    version_id: str_field(params, "version_id"),
                })
                .await?
                .into_inner();
            Ok(json!({
                "key": response.object_key,
                "size": response.size,
                "etag": response.etag,
                "content_type": response.content_type,
                "last_modified": response.last_modified,
            }))
        }
        "delete_object" => {
            client
                .delete_object(objectstore::DeleteObjectRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    object_key: str_field(params, "key"),
                    version_id: str_field(params, "version_id"),
                })
                .await?;
            Ok(json!({ "deleted": true }))
        }
        "get_presigned_url" => {
            let response = client
                .get_presigned_url(objectstore::GetPresignedUrlRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    logical_bucket: str_field(params, "bucket"),
                    object_key: str_field(params, "key"),
                    expiry_seconds: i64_field(params, "expiry_seconds"),
                })
                .await?
                .into_inner();
            Ok(json!({ "url": response.url, "expiry_seconds": response.expiry_seconds }))
        }
        other => Err(unknown("minio", other)),
    }
}

async fn dispatch_broker(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.broker.clone();
    match operation {
        "publish" => {
            client
                .publish(broker::PublishRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    subject: str_field(params, "subject"),
                    data: bytes_field(params, "data"),
                    headers: Default::default(),
                })
                .await?;
            Ok(json!({ "published": true }))
        }
        "publish_to_stream" => {
            let response = client
                .publish_to_stream(broker::PublishToStreamRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    subject: str_field(params, "subject"),
                    data: bytes_field(params, "data"),
                    headers: Default::default(),
                })
                .await?
                .into_inner();
            Ok(json!({ "sequence": response.sequence, "timestamp": response.timestamp }))
        }
        "create_stream" => {
            let response = client
                .create_stream(broker::CreateStreamRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    config: Some(broker::StreamConfig {
                        name: str_field(params, "stream"),
                        subjects: params
                            .get("subjects")
                            .and_then(Value::as_array)
                            .map(|subjects| {
                                subjects
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_owned)
                                    .collect()
                            })
                            .unwrap_or_default(),
                        storage: str_field(params, "storage"),
                        max_msgs: i64_field(params, "max_msgs"),
                        max_bytes: i64_field(params, "max_bytes"),
                        max_age_seconds: i64_field(params, "max_age_seconds"),
                        max_msg_size: i64_field(params, "max_msg_size") as i32,
                        replicas: i64_field(params, "replicas") as i32,
                        discard_policy: str_field(params, "discard_policy"),
                    }),
                })
                .await?
                .into_inner();
            Ok(json!({
                "stream": response.config.map(|c| c.name).unwrap_or_default(),
                "messages": response.messages,
            }))
        }
        "list_streams" => {
            let response = client
                .list_streams(broker::ListStreamsRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                })
                .await?
                .into_inner();
            let streams: Vec<Value> = response
                .streams
                .iter()
                .map(|s| {
                    json!({
                        "name": s.config.as_ref().map(|c| c.name.clone()).unwrap_or_default(),
                        "messages": s.messages,
                        "bytes": s.bytes,
                    })
                })
                .collect();
            Ok(json!({ "streams": streams }))
        }
        "pull_messages" => {
            let response = client
                .pull_messages(broker::PullMessagesRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    stream: str_field(params, "stream"),
                    consumer: str_field(params, "consumer"),
                    batch_size: i64_field(params, "batch_size") as i32,
                    max_wait_ms: i64_field(params, "max_wait_ms"),
                })
                .await?
                .into_inner();
            let messages: Vec<Value> = response
                .messages
                .iter()
                .map(|m| {
                    json!({
                        "subject": m.subject,
                        "data": String::from_utf8_lossy(&m.data),
                        "sequence": m.sequence,
                        "ack_subject": m.ack_subject,
                    })
                })
                .collect();
            Ok(json!({ "messages": messages }))
        }
        "kv_put" => {
            let response = client
                .kv_put(broker::KvPutRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    bucket: str_field(params, "bucket"),
                    key: str_field(params, "key"),
                    value: bytes_field(params, "value"),
                })
                .await?
                .into_inner();
            Ok(json!({ "revision": response.revision }))
        }
        "kv_get" => {
            let response = client
                .kv_get(broker::KvGetRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    bucket: str_field(params, "bucket"),
                    key: str_field(params, "key"),
                })
                .await?
                .into_inner();
            Ok(json!({
                "value": String::from_utf8_lossy(&response.value),
                "revision": response.revision,
            }))
        }
        other => Err(unknown("nats", other)),
    }
}

async fn dispatch_cache(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.cache.clone();
    match operation {
        "get" => {
            let response = client
                .get(cache::GetRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    key: str_field(params, "key"),
                })
                .await?
                .into_inner();
            Ok(json!({ "value": String::from_utf8_lossy(&response.value) }))
        }
        "set" => {
            client
                .set(cache::SetRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    key: str_field(params, "key"),
                    value: bytes_field(params, "value"),
                    ttl_seconds: i64_field(params, "ttl_seconds"),
                })
                .await?;
            Ok(json!({ "set": true }))
        }
        "delete" => {
            let keys = params
                .get("keys")
                .and_then(Value::as_array)
                .map(|keys| {
                    keys.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_else(|| vec![str_field(params, "key")]);
            let response = client
                .delete(cache::DeleteRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    keys,
                })
                .await?
                .into_inner();
            Ok(json!({ "deleted": response.deleted }))
        }
        "exists" => {
            let response = client
                .exists(cache::ExistsRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    key: str_field(params, "key"),
                })
                .await?
                .into_inner();
            Ok(json!({ "exists": response.exists }))
        }
        "increment" => {
            let response = client
                .increment(cache::IncrementRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    key: str_field(params, "key"),
                    delta: i64_field(params, "delta"),
                })
                .await?
                .into_inner();
            Ok(json!({ "value": response.value }))
        }
        "list_keys" => {
            let response = client
                .list_keys(cache::ListKeysRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    pattern: str_field(params, "pattern"),
                    limit: i64_field(params, "limit"),
                })
                .await?
                .into_inner();
            Ok(json!({ "keys": response.keys, "truncated": response.truncated }))
        }
        other => Err(unknown("redis", other)),
    }
}

async fn dispatch_vector(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.vector.clone();
    match operation {
        "create_collection" => {
            client
                .create_collection(vector::CreateCollectionRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    collection: str_field(params, "collection"),
                    vector_size: i64_field(params, "vector_size") as u64,
                    distance: str_field(params, "distance"),
                })
                .await?;
            Ok(json!({ "created": true }))
        }
        "list_collections" => {
            let response = client
                .list_collections(vector::ListCollectionsRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                })
                .await?
                .into_inner();
            Ok(json!({ "collections": response.collections }))
        }
        "delete_collection" => {
            client
                .delete_collection(vector::DeleteCollectionRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    collection: str_field(params, "collection"),
                })
                .await?;
            Ok(json!({ "deleted": true }))
        }
        "search" => {
            let response = client
                .search(vector::SearchRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    collection: str_field(params, "collection"),
                    vector: vector_field(params, "vector"),
                    limit: i64_field(params, "limit").max(0) as u64,
                    filter_json: json_field(params, "filter"),
                    score_threshold: params
                        .get("score_threshold")
                        .and_then(Value::as_f64)
                        .unwrap_or_default() as f32,
                    offset: i64_field(params, "offset").max(0) as u64,
                    with_payload: bool_field(params, "with_payload"),
                    with_vectors: bool_field(params, "with_vectors"),
                    params_json: String::new(),
                })
                .await?
                .into_inner();
            let results: Vec<Value> = response
                .results
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id.as_ref().map(|id| match &id.id {
                            Some(vector::point_id::Id::Num(n)) => json!(n),
                            Some(vector::point_id::Id::Uuid(u)) => json!(u),
                            None => Value::Null,
                        }),
                        "score": p.score,
                        "payload": p.payload_json,
                    })
                })
                .collect();
            Ok(json!({ "results": results }))
        }
        other => Err(unknown("qdrant", other)),
    }
}

async fn dispatch_graph(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.graph.clone();
    match operation {
        "run_cypher" => {
            let response = client
                .run_cypher(graph::RunCypherRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    cypher: str_field(params, "cypher"),
                    params_json: json_field(params, "params"),
                    write: bool_field(params, "write"),
                })
                .await?
                .into_inner();
            Ok(json!({
                "columns": response.columns,
                "rows": serde_json::from_str::<Value>(&response.rows_json).unwrap_or(Value::Null),
                "row_count": response.row_count,
            }))
        }
        "create_node" => {
            let response = client
                .create_node(graph::CreateNodeRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    labels: params
                        .get("labels")
                        .and_then(Value::as_array)
                        .map(|labels| {
                            labels
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default(),
                    properties_json: json_field(params, "properties"),
                })
                .await?
                .into_inner();
            Ok(json!({ "id": response.id, "labels": response.labels }))
        }
        "get_node" => {
            let response = client
                .get_node(graph::GetNodeRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    id: i64_field(params, "id"),
                })
                .await?
                .into_inner();
            Ok(json!({
                "id": response.id,
                "labels": response.labels,
                "properties": serde_json::from_str::<Value>(&response.properties_json)
                    .unwrap_or(Value::Null),
            }))
        }
        "find_nodes" => {
            let response = client
                .find_nodes(graph::FindNodesRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    label: str_field(params, "label"),
                    properties_json: json_field(params, "properties"),
                    limit: i64_field(params, "limit"),
                })
                .await?
                .into_inner();
            let nodes: Vec<Value> = response
                .nodes
                .iter()
                .map(|n| {
                    json!({
                        "id": n.id,
                        "labels": n.labels,
                        "properties": serde_json::from_str::<Value>(&n.properties_json)
                            .unwrap_or(Value::Null),
                    })
                })
                .collect();
            Ok(json!({ "nodes": nodes }))
        }
        other => Err(unknown("neo4j", other)),
    }
}

async fn dispatch_analytics(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.analytics.clone();
    match operation {
        "create_database" => {
            client
                .create_database(analytics::CreateDatabaseRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    database: str_field(params, "database"),
                })
                .await?;
            Ok(json!({ "created": true }))
        }
        "list_databases" => {
            let response = client
                .list_databases(analytics::ListDatabasesRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                })
                .await?
                .into_inner();
            Ok(json!({ "databases": response.databases }))
        }
        "execute_query" => {
            let response = client
                .execute_query(analytics::ExecuteQueryRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    database: str_field(params, "database"),
                    sql: str_field(params, "sql"),
                    params_json: json_field(params, "params"),
                    max_rows: i64_field(params, "max_rows"),
                    timeout_ms: i64_field(params, "timeout_ms"),
                    explain: bool_field(params, "explain"),
                })
                .await?
                .into_inner();
            Ok(json!({
                "columns": response.columns,
                "rows": serde_json::from_str::<Value>(&response.rows_json).unwrap_or(Value::Null),
                "summary": response.summary.map(|s| json!({
                    "row_count": s.row_count,
                    "elapsed_ms": s.elapsed_ms,
                    "truncated": s.truncated,
                })),
            }))
        }
        "execute_statement" => {
            let response = client
                .execute_statement(analytics::ExecuteStatementRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    database: str_field(params, "database"),
                    sql: str_field(params, "sql"),
                    params_json: json_field(params, "params"),
                })
                .await?
                .into_inner();
            Ok(json!({ "rows_affected": response.rows_affected }))
        }
        other => Err(unknown("duckdb", other)),
    }
}

async fn dispatch_relational(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.relational.clone();
    match operation {
        "query" => {
            let response = client
                .query(relational::QueryRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    table: str_field(params, "table"),
                    filter_json: json_field(params, "filter"),
                    columns: params
                        .get("columns")
                        .and_then(Value::as_array)
                        .map(|columns| {
                            columns
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_owned)
                                .collect()
                        })
                        .unwrap_or_default(),
                    limit: i64_field(params, "limit"),
                    offset: i64_field(params, "offset"),
                    order_by: str_field(params, "order_by"),
                    transaction_id: String::new(),
                })
                .await?
                .into_inner();
            Ok(json!({
                "rows": serde_json::from_str::<Value>(&response.rows_json).unwrap_or(Value::Null),
                "row_count": response.row_count,
            }))
        }
        "insert" => {
            let response = client
                .insert(relational::InsertRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    table: str_field(params, "table"),
                    rows_json: json_field(params, "rows"),
                    transaction_id: String::new(),
                })
                .await?
                .into_inner();
            Ok(json!({ "rows_affected": response.rows_affected }))
        }
        "update" => {
            let response = client
                .update(relational::UpdateRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    table: str_field(params, "table"),
                    set_json: json_field(params, "set"),
                    filter_json: json_field(params, "filter"),
                    transaction_id: String::new(),
                })
                .await?
                .into_inner();
            Ok(json!({ "rows_affected": response.rows_affected }))
        }
        "delete" => {
            let response = client
                .delete(relational::DeleteRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    table: str_field(params, "table"),
                    filter_json: json_field(params, "filter"),
                    transaction_id: String::new(),
                })
                .await?
                .into_inner();
            Ok(json!({ "rows_affected": response.rows_affected }))
        }
        "similarity_search" => {
            let response = client
                .similarity_search(relational::SimilaritySearchRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    table: str_field(params, "table"),
                    query_vector: vector_field(params, "vector"),
                    limit: i64_field(params, "limit"),
                    filter_json: json_field(params, "filter"),
                    threshold: params
                        .get("threshold")
                        .and_then(Value::as_f64)
                        .unwrap_or_default() as f32,
                })
                .await?
                .into_inner();
            let matches: Vec<Value> = response
                .matches
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "score": m.score,
                        "metadata": serde_json::from_str::<Value>(&m.metadata_json)
                            .unwrap_or(Value::Null),
                    })
                })
                .collect();
            Ok(json!({ "matches": matches }))
        }
        other => Err(unknown("supabase", other)),
    }
}

async fn dispatch_mqtt(
    clients: &AdapterClients,
    operation: &str,
    user_id: &str,
    organization_id: &str,
    params: &Value,
) -> Result<Value, Status> {
    let mut client = clients.mqtt.clone();
    match operation {
        "send_command_to_device" => {
            client
                .send_command_to_device(mqtt::SendCommandToDeviceRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    device_id: str_field(params, "device_id"),
                    command_json: json_field(params, "command"),
                    qos: i64_field(params, "qos") as i32,
                })
                .await?;
            Ok(json!({ "sent": true }))
        }
        "publish_notification_to_user" => {
            client
                .publish_notification_to_user(mqtt::PublishNotificationToUserRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    target_user_id: str_field(params, "target_user_id"),
                    payload_json: json_field(params, "payload"),
                })
                .await?;
            Ok(json!({ "published": true }))
        }
        "publish_system_notification" => {
            client
                .publish_system_notification(mqtt::PublishSystemNotificationRequest {
                    user_id: user_id.to_string(),
                    organization_id: organization_id.to_string(),
                    payload_json: json_field(params, "payload"),
                    severity: str_field(params, "severity"),
                })
                .await?;
            Ok(json!({ "published": true }))
        }
        other => Err(unknown("mqtt", other)),
    }
}
