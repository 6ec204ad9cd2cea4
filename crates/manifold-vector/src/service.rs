//! The vector-search gRPC service.

use manifold_core::{AdapterContext, Error, Result};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use proto_manifold::vector::vector_search_server::VectorSearch;
use proto_manifold::vector::{
    CollectionInfo, CreateCollectionRequest, CreateSnapshotRequest, DeleteCollectionRequest,
    DeletePointsRequest, DeletePointsResponse, DeleteSnapshotRequest, GetCollectionInfoRequest,
    GetPointsRequest, GetPointsResponse, ListCollectionsRequest, ListCollectionsResponse,
    ListSnapshotsRequest, ListSnapshotsResponse, Point, RecommendRequest, ScoredPoint,
    ScrollRequest, ScrollResponse, SearchBatchRequest, SearchBatchResponse, SearchRequest,
    SearchResponse, SnapshotInfo, UpsertPointsRequest, UpsertPointsResponse,
};
use qdrant_client::qdrant::{
    self, CreateCollectionBuilder, DeletePointsBuilder, GetPointsBuilder, PointStruct,
    RecommendPointsBuilder, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use tonic::{Request, Response, Status};

use crate::convert;

pub struct VectorService {
    ctx: AdapterContext,
    client: Qdrant,
}

impl VectorService {
    pub fn new(ctx: AdapterContext, client: Qdrant) -> Self {
        Self { ctx, client }
    }
}

fn required(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::InvalidArgument(format!("{field} is required")))
    } else {
        Ok(())
    }
}

fn classify(context: &str, err: qdrant_client::QdrantError) -> Error {
    match err {
        qdrant_client::QdrantError::ResponseError { status } => {
            let detail = format!("{context}: {}", status.message());
            match status.code() {
                tonic::Code::NotFound => Error::NotFound(detail),
                tonic::Code::AlreadyExists => Error::AlreadyExists(detail),
                tonic::Code::InvalidArgument => Error::InvalidArgument(detail),
                tonic::Code::PermissionDenied => Error::PermissionDenied(detail),
                tonic::Code::DeadlineExceeded => Error::DeadlineExceeded(detail),
                tonic::Code::ResourceExhausted => Error::ResourceExhausted(detail),
                tonic::Code::Unavailable => Error::Unavailable(detail),
                _ => Error::Internal(detail),
            }
        }
        other => Error::Internal(format!("{context}: {other}")),
    }
}

/// Optional backend search tuning, e.g. `{"hnsw_ef": 128, "exact": true}`.
fn search_params(params_json: &str) -> Result<Option<qdrant::SearchParams>> {
    if params_json.is_empty() {
        return Ok(None);
    }
    let json: serde_json::Value = serde_json::from_str(params_json)
        .map_err(|err| Error::InvalidArgument(format!("invalid search params: {err}")))?;
    Ok(Some(qdrant::SearchParams {
        hnsw_ef: json.get("hnsw_ef").and_then(|v| v.as_u64()),
        exact: json.get("exact").and_then(|v| v.as_bool()),
        ..Default::default()
    }))
}

fn output_vector(vectors: Option<qdrant::VectorsOutput>) -> Vec<f32> {
    use qdrant::vectors_output::VectorsOptions;
    match vectors.and_then(|v| v.vectors_options) {
        Some(VectorsOptions::Vector(v)) => v.data,
        _ => Vec::new(),
    }
}

fn scored_point_to_proto(point: qdrant::ScoredPoint, with_payload: bool, with_vectors: bool) -> ScoredPoint {
    ScoredPoint {
        id: point.id.as_ref().map(convert::point_id_to_proto),
        score: point.score,
        payload_json: if with_payload {
            convert::payload_to_json(&point.payload)
        } else {
            String::new()
        },
        vector: if with_vectors {
            output_vector(point.vectors)
        } else {
            Vec::new()
        },
    }
}

impl VectorService {
    async fn do_create_collection(&self, req: CreateCollectionRequest) -> Result<Ack> {
        required("collection", &req.collection)?;
        if req.vector_size == 0 {
            return Err(Error::InvalidArgument(
                "vector_size must be positive".to_string(),
            ));
        }
        let distance = convert::distance(&req.distance)?;

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&req.collection)
                    .vectors_config(VectorParamsBuilder::new(req.vector_size, distance)),
            )
            .await
            .map_err(|err| classify("create_collection", err))?;
        Ok(Ack {})
    }

    async fn do_delete_collection(&self, req: DeleteCollectionRequest) -> Result<Ack> {
        required("collection", &req.collection)?;

        // A collection holding any other tenant's points must not be
        // deletable through a leaked name.
        let probe = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&req.collection)
                    .filter(convert::foreign_points_filter(&req.user_id))
                    .limit(1),
            )
            .await
            .map_err(|err| classify("delete_collection", err))?;
        if !probe.result.is_empty() {
            return Err(Error::PermissionDenied(format!(
                "collection '{}' contains points owned by another tenant",
                req.collection
            )));
        }

        self.client
            .delete_collection(&req.collection)
            .await
            .map_err(|err| classify("delete_collection", err))?;
        Ok(Ack {})
    }

    async fn do_list_collections(
        &self,
        _req: ListCollectionsRequest,
    ) -> Result<ListCollectionsResponse> {
        let response = self
            .client
            .list_collections()
            .await
            .map_err(|err| classify("list_collections", err))?;
        Ok(ListCollectionsResponse {
            collections: response
                .collections
                .into_iter()
                .map(|c| c.name)
                .collect(),
        })
    }

    async fn do_get_collection_info(&self, req: GetCollectionInfoRequest) -> Result<CollectionInfo> {
        required("collection", &req.collection)?;
        let response = self
            .client
            .collection_info(&req.collection)
            .await
            .map_err(|err| classify("get_collection_info", err))?;
        let info = response
            .result
            .ok_or_else(|| Error::NotFound(format!("collection '{}' not found", req.collection)))?;

        let (vector_size, distance) = info
            .config
            .as_ref()
            .and_then(|c| c.params.as_ref())
            .and_then(|p| p.vectors_config.as_ref())
            .and_then(|v| v.config.as_ref())
            .map(|config| match config {
                qdrant::vectors_config::Config::Params(params) => (
                    params.size,
                    qdrant::Distance::try_from(params.distance)
                        .map(convert::distance_name)
                        .unwrap_or("unknown"),
                ),
                qdrant::vectors_config::Config::ParamsMap(_) => (0, "unknown"),
            })
            .unwrap_or((0, "unknown"));

        let status = qdrant::CollectionStatus::try_from(info.status)
            .map(|s| match s {
                qdrant::CollectionStatus::Green => "green",
                qdrant::CollectionStatus::Yellow => "yellow",
                qdrant::CollectionStatus::Red => "red",
                _ => "unknown",
            })
            .unwrap_or("unknown");

        Ok(CollectionInfo {
            collection: req.collection,
            vector_size,
            distance: distance.to_string(),
            points_count: info.points_count.unwrap_or_default(),
            segments_count: info.segments_count,
            status: status.to_string(),
        })
    }

    async fn do_upsert_points(&self, req: UpsertPointsRequest) -> Result<UpsertPointsResponse> {
        required("collection", &req.collection)?;
        if req.points.is_empty() {
            return Err(Error::InvalidArgument("points is required".to_string()));
        }

        let mut points = Vec::with_capacity(req.points.len());
        for point in &req.points {
            let id = point
                .id
                .as_ref()
                .ok_or_else(|| Error::InvalidArgument("point id is required".to_string()))?;
            let payload =
                convert::payload_with_owner(&point.payload_json, &req.user_id, &req.organization_id)?;
            points.push(PointStruct::new(
                convert::point_id_to_backend(id)?,
                point.vector.clone(),
                payload,
            ));
        }
        let upserted = points.len() as i64;

        self.client
            .upsert_points(UpsertPointsBuilder::new(&req.collection, points).wait(true))
            .await
            .map_err(|err| classify("upsert_points", err))?;
        Ok(UpsertPointsResponse { upserted })
    }

    async fn do_get_points(&self, req: GetPointsRequest) -> Result<GetPointsResponse> {
        required("collection", &req.collection)?;
        if req.ids.is_empty() {
            return Err(Error::InvalidArgument("ids is required".to_string()));
        }
        let ids = req
            .ids
            .iter()
            .map(convert::point_id_to_backend)
            .collect::<Result<Vec<_>>>()?;

        // Payloads are always fetched so the owner tag can be checked;
        // they are only surfaced when the caller asked for them.
        let response = self
            .client
            .get_points(
                GetPointsBuilder::new(&req.collection, ids)
                    .with_payload(true)
                    .with_vectors(req.with_vectors),
            )
            .await
            .map_err(|err| classify("get_points", err))?;

        let points = response
            .result
            .into_iter()
            .filter(|point| convert::owned_by(&point.payload, &req.user_id))
            .map(|point| Point {
                id: point.id.as_ref().map(convert::point_id_to_proto),
                vector: if req.with_vectors {
                    output_vector(point.vectors)
                } else {
                    Vec::new()
                },
                payload_json: if req.with_payload {
                    convert::payload_to_json(&point.payload)
                } else {
                    String::new()
                },
            })
            .collect();

        Ok(GetPointsResponse { points })
    }

    async fn do_delete_points(&self, req: DeletePointsRequest) -> Result<DeletePointsResponse> {
        required("collection", &req.collection)?;
        if req.ids.is_empty() {
            return Err(Error::InvalidArgument("ids is required".to_string()));
        }
        let ids = req
            .ids
            .iter()
            .map(convert::point_id_to_backend)
            .collect::<Result<Vec<_>>>()?;
        let deleted = ids.len() as i64;

        // Deletion is filtered on both the requested ids and the owner
        // tag, so ids leaked across tenants are inert.
        let filter = qdrant::Filter::must([
            qdrant::Condition::has_id(ids),
            qdrant::Condition::matches(convert::OWNER_USER_KEY, req.user_id.clone()),
        ]);

        self.client
            .delete_points(
                DeletePointsBuilder::new(&req.collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|err| classify("delete_points", err))?;
        Ok(DeletePointsResponse { deleted })
    }

    async fn do_search(&self, req: SearchRequest) -> Result<SearchResponse> {
        required("collection", &req.collection)?;
        if req.limit == 0 {
            return Ok(SearchResponse {
                results: Vec::new(),
            });
        }
        if req.vector.is_empty() {
            return Err(Error::InvalidArgument("vector is required".to_string()));
        }

        let filter = convert::tenant_filter(&req.user_id, &req.filter_json)?;
        let mut search =
            SearchPointsBuilder::new(&req.collection, req.vector.clone(), req.limit)
                .filter(filter)
                .with_payload(req.with_payload)
                .with_vectors(req.with_vectors);
        if req.score_threshold > 0.0 {
            search = search.score_threshold(req.score_threshold);
        }
        if req.offset > 0 {
            search = search.offset(req.offset);
        }
        if let Some(params) = search_params(&req.params_json)? {
            search = search.params(params);
        }

        let response = self
            .client
            .search_points(search)
            .await
            .map_err(|err| classify("search", err))?;

        Ok(SearchResponse {
            results: response
                .result
                .into_iter()
                .map(|p| scored_point_to_proto(p, req.with_payload, req.with_vectors))
                .collect(),
        })
    }

    async fn do_search_batch(&self, req: SearchBatchRequest) -> Result<SearchBatchResponse> {
        required("collection", &req.collection)?;
        if req.searches.is_empty() {
            return Err(Error::InvalidArgument("searches is required".to_string()));
        }

        let mut results = Vec::with_capacity(req.searches.len());
        for mut search in req.searches {
            search.user_id = req.user_id.clone();
            search.organization_id = req.organization_id.clone();
            if search.collection.is_empty() {
                search.collection = req.collection.clone();
            }
            results.push(self.do_search(search).await?);
        }
        Ok(SearchBatchResponse { results })
    }

    async fn do_recommend(&self, req: RecommendRequest) -> Result<SearchResponse> {
        required("collection", &req.collection)?;
        if req.positive.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one positive example is required".to_string(),
            ));
        }
        let limit = if req.limit == 0 { 10 } else { req.limit };

        let mut recommend = RecommendPointsBuilder::new(&req.collection, limit)
            .filter(convert::tenant_filter(&req.user_id, &req.filter_json)?)
            .with_payload(req.with_payload);
        for id in &req.positive {
            recommend = recommend.add_positive(convert::point_id_to_backend(id)?);
        }
        for id in &req.negative {
            recommend = recommend.add_negative(convert::point_id_to_backend(id)?);
        }

        let response = self
            .client
            .recommend(recommend)
            .await
            .map_err(|err| classify("recommend", err))?;

        Ok(SearchResponse {
            results: response
                .result
                .into_iter()
                .map(|p| scored_point_to_proto(p, req.with_payload, false))
                .collect(),
        })
    }

    async fn do_scroll(&self, req: ScrollRequest) -> Result<ScrollResponse> {
        required("collection", &req.collection)?;
        let limit = if req.limit == 0 { 10 } else { req.limit };

        let mut scroll = ScrollPointsBuilder::new(&req.collection)
            .filter(convert::tenant_filter(&req.user_id, &req.filter_json)?)
            .limit(limit)
            .with_payload(req.with_payload)
            .with_vectors(req.with_vectors);
        if let Some(offset) = &req.offset_id {
            scroll = scroll.offset(convert::point_id_to_backend(offset)?);
        }

        let response = self
            .client
            .scroll(scroll)
            .await
            .map_err(|err| classify("scroll", err))?;

        Ok(ScrollResponse {
            points: response
                .result
                .into_iter()
                .map(|point| Point {
                    id: point.id.as_ref().map(convert::point_id_to_proto),
                    vector: if req.with_vectors {
                        output_vector(point.vectors)
                    } else {
                        Vec::new()
                    },
                    payload_json: if req.with_payload {
                        convert::payload_to_json(&point.payload)
                    } else {
                        String::new()
                    },
                })
                .collect(),
            next_offset: response
                .next_page_offset
                .as_ref()
                .map(convert::point_id_to_proto),
        })
    }

    async fn do_create_snapshot(&self, req: CreateSnapshotRequest) -> Result<SnapshotInfo> {
        required("collection", &req.collection)?;
        let response = self
            .client
            .create_snapshot(&req.collection)
            .await
            .map_err(|err| classify("create_snapshot", err))?;
        let description = response.snapshot_description.ok_or_else(|| {
            Error::Internal("create_snapshot: backend returned no snapshot".to_string())
        })?;
        Ok(SnapshotInfo {
            created_at: description
                .creation_time
                .map(|t| t.seconds * 1000 + i64::from(t.nanos) / 1_000_000)
                .unwrap_or_default(),
            name: description.name,
            size_bytes: description.size,
        })
    }

    async fn do_list_snapshots(&self, req: ListSnapshotsRequest) -> Result<ListSnapshotsResponse> {
        required("collection", &req.collection)?;
        let response = self
            .client
            .list_snapshots(&req.collection)
            .await
            .map_err(|err| classify("list_snapshots", err))?;
        Ok(ListSnapshotsResponse {
            snapshots: response
                .snapshot_descriptions
                .into_iter()
                .map(|d| SnapshotInfo {
                    created_at: d
                        .creation_time
                        .map(|t| t.seconds * 1000 + i64::from(t.nanos) / 1_000_000)
                        .unwrap_or_default(),
                    name: d.name,
                    size_bytes: d.size,
                })
                .collect(),
        })
    }

    async fn do_delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<Ack> {
        required("collection", &req.collection)?;
        required("snapshot", &req.snapshot)?;
        self.client
            .delete_snapshot(qdrant::DeleteSnapshotRequestBuilder::new(
                &req.collection,
                &req.snapshot,
            ))
            .await
            .map_err(|err| classify("delete_snapshot", err))?;
        Ok(Ack {})
    }
}

#[tonic::async_trait]
impl VectorSearch for VectorService {
    async fn create_collection(
        &self,
        request: Request<CreateCollectionRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_collection", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        let result = self.do_create_collection(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_collection(
        &self,
        request: Request<DeleteCollectionRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_collection", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        let result = self.do_delete_collection(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_collections(
        &self,
        request: Request<ListCollectionsRequest>,
    ) -> std::result::Result<Response<ListCollectionsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_collections", &req.user_id, &req.organization_id)?;
        let result = self.do_list_collections(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_collection_info(
        &self,
        request: Request<GetCollectionInfoRequest>,
    ) -> std::result::Result<Response<CollectionInfo>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("get_collection_info", &req.user_id, &req.organization_id)?;
        let result = self.do_get_collection_info(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn upsert_points(
        &self,
        request: Request<UpsertPointsRequest>,
    ) -> std::result::Result<Response<UpsertPointsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("upsert_points", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        scope.annotate("points", req.points.len().to_string());
        let result = self.do_upsert_points(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_points(
        &self,
        request: Request<GetPointsRequest>,
    ) -> std::result::Result<Response<GetPointsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_points", &req.user_id, &req.organization_id)?;
        let result = self.do_get_points(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_points(
        &self,
        request: Request<DeletePointsRequest>,
    ) -> std::result::Result<Response<DeletePointsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_points", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        let result = self.do_delete_points(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn search(
        &self,
        request: Request<SearchRequest>,
    ) -> std::result::Result<Response<SearchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("search", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        let result = self.do_search(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn search_batch(
        &self,
        request: Request<SearchBatchRequest>,
    ) -> std::result::Result<Response<SearchBatchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("search_batch", &req.user_id, &req.organization_id)?;
        scope.annotate("searches", req.searches.len().to_string());
        let result = self.do_search_batch(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn recommend(
        &self,
        request: Request<RecommendRequest>,
    ) -> std::result::Result<Response<SearchResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("recommend", &req.user_id, &req.organization_id)?;
        let result = self.do_recommend(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn scroll(
        &self,
        request: Request<ScrollRequest>,
    ) -> std::result::Result<Response<ScrollResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("scroll", &req.user_id, &req.organization_id)?;
        let result = self.do_scroll(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> std::result::Result<Response<SnapshotInfo>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_snapshot", &req.user_id, &req.organization_id)?;
        scope.annotate("collection", req.collection.as_str());
        let result = self.do_create_snapshot(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> std::result::Result<Response<ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_snapshots", &req.user_id, &req.organization_id)?;
        let result = self.do_list_snapshots(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_snapshot", &req.user_id, &req.organization_id)?;
        scope.annotate("snapshot", req.snapshot.as_str());
        let result = self.do_delete_snapshot(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let response = match self.client.health_check().await {
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
