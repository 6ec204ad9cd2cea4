//! The graph gRPC service.
//!
//! Backend value types (nodes, relationships, paths, temporals) are
//! converted into a portable JSON representation before they cross the
//! wire; backend errors never do.

use manifold_core::{AdapterContext, Error, Result};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use proto_manifold::graph::graph_server::Graph;
use proto_manifold::graph::{
    CreateNodeRequest, CreateRelationshipRequest, DeleteNodeRequest, DeleteRelationshipRequest,
    FindNodesRequest, FindNodesResponse, FindRelationshipsRequest, FindRelationshipsResponse,
    GetNeighborsRequest, GetNeighborsResponse, GetNodeRequest, GetPathRequest,
    GetRelationshipRequest, GetShortestPathRequest, MergeNodeRequest, Node, Path, QueryResult,
    Relationship, RunCypherBatchRequest, RunCypherBatchResponse, RunCypherReadRequest,
    RunCypherRequest, RunCypherWriteRequest, UpdateNodeRequest, UpdateRelationshipRequest,
};
use tonic::{Request, Response, Status};

use crate::cypher::{self, Properties, TENANT_KEY};

const DEFAULT_FIND_LIMIT: i64 = 100;
const MAX_FIND_LIMIT: i64 = 1000;
const DEFAULT_PATH_DEPTH: i64 = 5;
const MAX_PATH_DEPTH: i64 = 15;

pub struct GraphService {
    ctx: AdapterContext,
    graph: neo4rs::Graph,
}

impl GraphService {
    pub fn new(ctx: AdapterContext, graph: neo4rs::Graph) -> Self {
        Self { ctx, graph }
    }
}

fn classify(context: &str, err: neo4rs::Error) -> Error {
    let text = err.to_string();
    let lower = text.to_lowercase();
    let detail = format!("{context}: {text}");

    if lower.contains("authentication") || lower.contains("unauthorized") {
        Error::PermissionDenied(detail)
    } else if lower.contains("syntaxerror")
        || lower.contains("parametermissing")
        || lower.contains("invalid")
    {
        Error::InvalidArgument(detail)
    } else if lower.contains("still has relationships")
        || lower.contains("constraintvalidation")
    {
        Error::FailedPrecondition(detail)
    } else if lower.contains("not found") {
        Error::NotFound(detail)
    } else if lower.contains("connection") || lower.contains("io error") || lower.contains("connect")
    {
        Error::Unavailable(detail)
    } else {
        Error::Internal(detail)
    }
}

fn deser(context: &str, err: impl std::fmt::Display) -> Error {
    Error::Internal(format!("{context}: decoding backend value: {err}"))
}

fn strip_tenant(value: &mut serde_json::Value) {
    if let serde_json::Value::Object(map) = value {
        map.remove(TENANT_KEY);
    }
}

fn node_to_proto(context: &str, node: &neo4rs::Node) -> Result<Node> {
    let mut properties: serde_json::Value = node.to().map_err(|err| deser(context, err))?;
    strip_tenant(&mut properties);
    Ok(Node {
        id: node.id(),
        labels: node.labels().iter().map(|l| l.to_string()).collect(),
        properties_json: properties.to_string(),
    })
}

fn relation_to_proto(context: &str, rel: &neo4rs::Relation) -> Result<Relationship> {
    let mut properties: serde_json::Value = rel.to().map_err(|err| deser(context, err))?;
    strip_tenant(&mut properties);
    Ok(Relationship {
        id: rel.id(),
        start_node_id: rel.start_node_id(),
        end_node_id: rel.end_node_id(),
        rel_type: rel.typ().to_string(),
        properties_json: properties.to_string(),
    })
}

impl GraphService {
    async fn rows(&self, context: &'static str, query: neo4rs::Query) -> Result<Vec<neo4rs::Row>> {
        let mut stream = self
            .graph
            .execute(query)
            .await
            .map_err(|err| classify(context, err))?;
        let mut rows = Vec::new();
        while let Some(row) = stream
            .next()
            .await
            .map_err(|err| classify(context, err))?
        {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Execute caller-supplied cypher with its parameters plus the bound
    /// tenant parameter, returning rows in portable JSON form.
    async fn do_run_cypher(
        &self,
        context: &'static str,
        user_id: &str,
        cypher_text: &str,
        params_json: &str,
    ) -> Result<QueryResult> {
        if cypher_text.trim().is_empty() {
            return Err(Error::InvalidArgument("cypher is required".to_string()));
        }

        let mut query = neo4rs::query(cypher_text).param(TENANT_KEY, user_id);
        if !params_json.is_empty() {
            let json: serde_json::Value = serde_json::from_str(params_json)
                .map_err(|err| Error::InvalidArgument(format!("invalid params: {err}")))?;
            let serde_json::Value::Object(map) = json else {
                return Err(Error::InvalidArgument(
                    "params must be a JSON object".to_string(),
                ));
            };
            for (key, value) in &map {
                if !cypher::is_identifier(key) {
                    return Err(Error::InvalidArgument(format!(
                        "'{key}' is not a valid parameter name"
                    )));
                }
                query = query.param(key, cypher::json_to_bolt(value)?);
            }
        }

        let rows = self.rows(context, query).await?;
        let mut columns: Vec<String> = Vec::new();
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let value: serde_json::Value = row.to().map_err(|err| deser(context, err))?;
            if columns.is_empty() {
                if let serde_json::Value::Object(map) = &value {
                    columns = map.keys().cloned().collect();
                }
            }
            out.push(value);
        }

        Ok(QueryResult {
            columns,
            row_count: out.len() as i64,
            rows_json: serde_json::Value::Array(out).to_string(),
        })
    }

    async fn do_create_node(&self, req: CreateNodeRequest) -> Result<Node> {
        let labels = cypher::label_fragment(&req.labels)?;
        let props = Properties::parse(&req.properties_json, "p")?;

        let mut set = format!("n.`{TENANT_KEY}` = $tenant");
        if !props.is_empty() {
            set.push_str(", ");
            set.push_str(&props.set_fragment("n"));
        }
        let text = format!("CREATE (n{labels}) SET {set} RETURN n");

        let query = props.apply(neo4rs::query(&text).param("tenant", req.user_id.as_str()));
        let rows = self.rows("create_node", query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Internal("create_node: backend returned no row".to_string()))?;
        let node: neo4rs::Node = row.get("n").map_err(|err| deser("create_node", err))?;
        node_to_proto("create_node", &node)
    }

    async fn fetch_node(
        &self,
        context: &'static str,
        user_id: &str,
        id: i64,
    ) -> Result<neo4rs::Node> {
        let text = format!(
            "MATCH (n) WHERE id(n) = $id AND n.`{TENANT_KEY}` = $tenant RETURN n"
        );
        let query = neo4rs::query(&text).param("id", id).param("tenant", user_id);
        let rows = self.rows(context, query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("node {id} not found")))?;
        row.get("n").map_err(|err| deser(context, err))
    }

    async fn do_update_node(&self, req: UpdateNodeRequest) -> Result<Node> {
        let props = Properties::parse(&req.properties_json, "p")?;
        if props.is_empty() {
            let node = self.fetch_node("update_node", &req.user_id, req.id).await?;
            return node_to_proto("update_node", &node);
        }

        let text = format!(
            "MATCH (n) WHERE id(n) = $id AND n.`{TENANT_KEY}` = $tenant SET {} RETURN n",
            props.set_fragment("n"),
        );
        let query = props.apply(
            neo4rs::query(&text)
                .param("id", req.id)
                .param("tenant", req.user_id.as_str()),
        );
        let rows = self.rows("update_node", query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("node {} not found", req.id)))?;
        let node: neo4rs::Node = row.get("n").map_err(|err| deser("update_node", err))?;
        node_to_proto("update_node", &node)
    }

    async fn do_delete_node(&self, req: DeleteNodeRequest) -> Result<Ack> {
        let delete = if req.detach { "DETACH DELETE" } else { "DELETE" };
        let text = format!(
            "MATCH (n) WHERE id(n) = $id AND n.`{TENANT_KEY}` = $tenant {delete} n \
             RETURN count(n) AS deleted"
        );
        let query = neo4rs::query(&text)
            .param("id", req.id)
            .param("tenant", req.user_id.as_str());
        let rows = self.rows("delete_node", query).await?;
        let deleted: i64 = rows
            .first()
            .and_then(|row| row.get("deleted").ok())
            .unwrap_or_default();
        if deleted == 0 {
            return Err(Error::NotFound(format!("node {} not found", req.id)));
        }
        Ok(Ack {})
    }

    async fn do_merge_node(&self, req: MergeNodeRequest) -> Result<Node> {
        let labels = cypher::label_fragment(&req.labels)?;
        let match_props = Properties::parse(&req.match_properties_json, "m")?;
        if match_props.is_empty() {
            return Err(Error::InvalidArgument(
                "match_properties is required".to_string(),
            ));
        }
        let set_props = Properties::parse(&req.set_properties_json, "s")?;

        // The tenant property participates in the merge key so one
        // tenant's merge can never match another tenant's node.
        let mut inline_parts = vec![format!("`{TENANT_KEY}`: $tenant")];
        inline_parts.extend(
            match_props
                .entries
                .iter()
                .map(|(key, param, _)| format!("`{key}`: ${param}")),
        );
        let inline = format!("{{{}}}", inline_parts.join(", "));

        let mut set = format!("n.`{TENANT_KEY}` = $tenant");
        if !set_props.is_empty() {
            set.push_str(", ");
            set.push_str(&set_props.set_fragment("n"));
        }

        let text = format!("MERGE (n{labels} {inline}) SET {set} RETURN n");
        let query = set_props.apply(match_props.apply(
            neo4rs::query(&text).param("tenant", req.user_id.as_str()),
        ));
        let rows = self.rows("merge_node", query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Internal("merge_node: backend returned no row".to_string()))?;
        let node: neo4rs::Node = row.get("n").map_err(|err| deser("merge_node", err))?;
        node_to_proto("merge_node", &node)
    }

    async fn do_find_nodes(&self, req: FindNodesRequest) -> Result<FindNodesResponse> {
        let label = if req.label.is_empty() {
            String::new()
        } else {
            format!(":{}", cypher::quote_identifier(&req.label)?)
        };
        let props = Properties::parse(&req.properties_json, "p")?;
        let limit = cypher::effective_limit(req.limit, DEFAULT_FIND_LIMIT, MAX_FIND_LIMIT);

        let mut conditions = vec![format!("n.`{TENANT_KEY}` = $tenant")];
        if !props.is_empty() {
            conditions.push(props.where_fragment("n"));
        }
        let text = format!(
            "MATCH (n{label}) WHERE {} RETURN n LIMIT {limit}",
            conditions.join(" AND "),
        );
        let query = props.apply(neo4rs::query(&text).param("tenant", req.user_id.as_str()));

        let rows = self.rows("find_nodes", query).await?;
        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let node: neo4rs::Node = row.get("n").map_err(|err| deser("find_nodes", err))?;
            nodes.push(node_to_proto("find_nodes", &node)?);
        }
        Ok(FindNodesResponse { nodes })
    }

    async fn do_create_relationship(&self, req: CreateRelationshipRequest) -> Result<Relationship> {
        let rel_type = cypher::quote_identifier(&req.rel_type)?;
        let props = Properties::parse(&req.properties_json, "p")?;

        let mut set = format!("r.`{TENANT_KEY}` = $tenant");
        if !props.is_empty() {
            set.push_str(", ");
            set.push_str(&props.set_fragment("r"));
        }
        let text = format!(
            "MATCH (a), (b) \
             WHERE id(a) = $start AND id(b) = $end \
               AND a.`{TENANT_KEY}` = $tenant AND b.`{TENANT_KEY}` = $tenant \
             CREATE (a)-[r:{rel_type}]->(b) SET {set} RETURN r"
        );
        let query = props.apply(
            neo4rs::query(&text)
                .param("start", req.start_node_id)
                .param("end", req.end_node_id)
                .param("tenant", req.user_id.as_str()),
        );

        let rows = self.rows("create_relationship", query).await?;
        let row = rows.first().ok_or_else(|| {
            Error::NotFound(format!(
                "nodes {} and {} not found",
                req.start_node_id, req.end_node_id
            ))
        })?;
        let rel: neo4rs::Relation = row
            .get("r")
            .map_err(|err| deser("create_relationship", err))?;
        relation_to_proto("create_relationship", &rel)
    }

    async fn do_get_relationship(&self, req: GetRelationshipRequest) -> Result<Relationship> {
        let text = format!(
            "MATCH ()-[r]->() WHERE id(r) = $id AND r.`{TENANT_KEY}` = $tenant RETURN r"
        );
        let query = neo4rs::query(&text)
            .param("id", req.id)
            .param("tenant", req.user_id.as_str());
        let rows = self.rows("get_relationship", query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("relationship {} not found", req.id)))?;
        let rel: neo4rs::Relation = row.get("r").map_err(|err| deser("get_relationship", err))?;
        relation_to_proto("get_relationship", &rel)
    }

    async fn do_update_relationship(&self, req: UpdateRelationshipRequest) -> Result<Relationship> {
        let props = Properties::parse(&req.properties_json, "p")?;
        if props.is_empty() {
            return self
                .do_get_relationship(GetRelationshipRequest {
                    user_id: req.user_id,
                    organization_id: req.organization_id,
                    id: req.id,
                })
                .await;
        }

        let text = format!(
            "MATCH ()-[r]->() WHERE id(r) = $id AND r.`{TENANT_KEY}` = $tenant \
             SET {} RETURN r",
            props.set_fragment("r"),
        );
        let query = props.apply(
            neo4rs::query(&text)
                .param("id", req.id)
                .param("tenant", req.user_id.as_str()),
        );
        let rows = self.rows("update_relationship", query).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::NotFound(format!("relationship {} not found", req.id)))?;
        let rel: neo4rs::Relation = row
            .get("r")
            .map_err(|err| deser("update_relationship", err))?;
        relation_to_proto("update_relationship", &rel)
    }

    async fn do_delete_relationship(&self, req: DeleteRelationshipRequest) -> Result<Ack> {
        let text = format!(
            "MATCH ()-[r]->() WHERE id(r) = $id AND r.`{TENANT_KEY}` = $tenant \
             DELETE r RETURN count(r) AS deleted"
        );
        let query = neo4rs::query(&text)
            .param("id", req.id)
            .param("tenant", req.user_id.as_str());
        let rows = self.rows("delete_relationship", query).await?;
        let deleted: i64 = rows
            .first()
            .and_then(|row| row.get("deleted").ok())
            .unwrap_or_default();
        if deleted == 0 {
            return Err(Error::NotFound(format!("relationship {} not found", req.id)));
        }
        Ok(Ack {})
    }

    async fn do_find_relationships(
        &self,
        req: FindRelationshipsRequest,
    ) -> Result<FindRelationshipsResponse> {
        let rel_type = if req.rel_type.is_empty() {
            String::new()
        } else {
            format!(":{}", cypher::quote_identifier(&req.rel_type)?)
        };
        let props = Properties::parse(&req.properties_json, "p")?;
        let limit = cypher::effective_limit(req.limit, DEFAULT_FIND_LIMIT, MAX_FIND_LIMIT);

        let mut conditions = vec![format!("r.`{TENANT_KEY}` = $tenant")];
        if !props.is_empty() {
            conditions.push(props.where_fragment("r"));
        }
        let text = format!(
            "MATCH ()-[r{rel_type}]->() WHERE {} RETURN r LIMIT {limit}",
            conditions.join(" AND "),
        );
        let query = props.apply(neo4rs::query(&text).param("tenant", req.user_id.as_str()));

        let rows = self.rows("find_relationships", query).await?;
        let mut relationships = Vec::with_capacity(rows.len());
        for row in &rows {
            let rel: neo4rs::Relation = row
                .get("r")
                .map_err(|err| deser("find_relationships", err))?;
            relationships.push(relation_to_proto("find_relationships", &rel)?);
        }
        Ok(FindRelationshipsResponse { relationships })
    }

    async fn path_query(
        &self,
        context: &'static str,
        user_id: &str,
        text: String,
        start: i64,
        end: i64,
    ) -> Result<Path> {
        let query = neo4rs::query(&text)
            .param("start", start)
            .param("end", end)
            .param("tenant", user_id);
        let rows = self.rows(context, query).await?;
        let row = rows.first().ok_or_else(|| {
            Error::NotFound(format!("no path between nodes {start} and {end}"))
        })?;
        let path: neo4rs::Path = row.get("p").map_err(|err| deser(context, err))?;

        let mut nodes = Vec::new();
        for node in path.nodes() {
            nodes.push(node_to_proto(context, &node)?);
        }
        let mut relationships = Vec::new();
        for rel in path.rels() {
            relationships.push(relation_to_proto(context, &rel)?);
        }
        Ok(Path {
            nodes,
            relationships,
        })
    }

    async fn do_get_path(&self, req: GetPathRequest) -> Result<Path> {
        let depth = cypher::effective_limit(req.max_depth, DEFAULT_PATH_DEPTH, MAX_PATH_DEPTH);
        let text = format!(
            "MATCH p = (a)-[*..{depth}]-(b) \
             WHERE id(a) = $start AND id(b) = $end AND a.`{TENANT_KEY}` = $tenant \
             RETURN p LIMIT 1"
        );
        self.path_query("get_path", &req.user_id, text, req.start_node_id, req.end_node_id)
            .await
    }

    async fn do_get_shortest_path(&self, req: GetShortestPathRequest) -> Result<Path> {
        let depth = cypher::effective_limit(req.max_depth, DEFAULT_PATH_DEPTH, MAX_PATH_DEPTH);
        let text = format!(
            "MATCH (a), (b) \
             WHERE id(a) = $start AND id(b) = $end \
               AND a.`{TENANT_KEY}` = $tenant AND b.`{TENANT_KEY}` = $tenant \
             MATCH p = shortestPath((a)-[*..{depth}]-(b)) RETURN p LIMIT 1"
        );
        self.path_query(
            "get_shortest_path",
            &req.user_id,
            text,
            req.start_node_id,
            req.end_node_id,
        )
        .await
    }

    async fn do_get_neighbors(&self, req: GetNeighborsRequest) -> Result<GetNeighborsResponse> {
        let (left, right) = cypher::direction_arrows(&req.direction)?;
        let rel_type = if req.rel_type.is_empty() {
            String::new()
        } else {
            format!(":{}", cypher::quote_identifier(&req.rel_type)?)
        };
        let limit = cypher::effective_limit(req.limit, DEFAULT_FIND_LIMIT, MAX_FIND_LIMIT);

        let text = format!(
            "MATCH (n){left}[r{rel_type}]{right}(m) \
             WHERE id(n) = $id AND n.`{TENANT_KEY}` = $tenant AND m.`{TENANT_KEY}` = $tenant \
             RETURN DISTINCT m LIMIT {limit}"
        );
        let query = neo4rs::query(&text)
            .param("id", req.id)
            .param("tenant", req.user_id.as_str());

        let rows = self.rows("get_neighbors", query).await?;
        let mut neighbors = Vec::with_capacity(rows.len());
        for row in &rows {
            let node: neo4rs::Node = row.get("m").map_err(|err| deser("get_neighbors", err))?;
            neighbors.push(node_to_proto("get_neighbors", &node)?);
        }
        Ok(GetNeighborsResponse { neighbors })
    }
}

#[tonic::async_trait]
impl Graph for GraphService {
    async fn run_cypher(
        &self,
        request: Request<RunCypherRequest>,
    ) -> std::result::Result<Response<QueryResult>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("run_cypher", &req.user_id, &req.organization_id)?;
        let result = self
            .do_run_cypher("run_cypher", &req.user_id, &req.cypher, &req.params_json)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn run_cypher_read(
        &self,
        request: Request<RunCypherReadRequest>,
    ) -> std::result::Result<Response<QueryResult>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("run_cypher_read", &req.user_id, &req.organization_id)?;
        let result = self
            .do_run_cypher("run_cypher_read", &req.user_id, &req.cypher, &req.params_json)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn run_cypher_write(
        &self,
        request: Request<RunCypherWriteRequest>,
    ) -> std::result::Result<Response<QueryResult>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("run_cypher_write", &req.user_id, &req.organization_id)?;
        let result = self
            .do_run_cypher("run_cypher_write", &req.user_id, &req.cypher, &req.params_json)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn run_cypher_batch(
        &self,
        request: Request<RunCypherBatchRequest>,
    ) -> std::result::Result<Response<RunCypherBatchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("run_cypher_batch", &req.user_id, &req.organization_id)?;
        scope.annotate("statements", req.statements.len().to_string());
        let result = async {
            if req.statements.is_empty() {
                return Err(Error::InvalidArgument("statements is required".to_string()));
            }
            let mut results = Vec::with_capacity(req.statements.len());
            for statement in &req.statements {
                results.push(
                    self.do_run_cypher(
                        "run_cypher_batch",
                        &req.user_id,
                        &statement.cypher,
                        &statement.params_json,
                    )
                    .await?,
                );
            }
            Ok(RunCypherBatchResponse { results })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_node(
        &self,
        request: Request<CreateNodeRequest>,
    ) -> std::result::Result<Response<Node>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_node", &req.user_id, &req.organization_id)?;
        scope.annotate("labels", req.labels.join(","));
        let result = self.do_create_node(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_node(
        &self,
        request: Request<GetNodeRequest>,
    ) -> std::result::Result<Response<Node>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_node", &req.user_id, &req.organization_id)?;
        let result = async {
            let node = self.fetch_node("get_node", &req.user_id, req.id).await?;
            node_to_proto("get_node", &node)
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn update_node(
        &self,
        request: Request<UpdateNodeRequest>,
    ) -> std::result::Result<Response<Node>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("update_node", &req.user_id, &req.organization_id)?;
        let result = self.do_update_node(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_node(
        &self,
        request: Request<DeleteNodeRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_node", &req.user_id, &req.organization_id)?;
        scope.annotate("node", req.id.to_string());
        let result = self.do_delete_node(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn merge_node(
        &self,
        request: Request<MergeNodeRequest>,
    ) -> std::result::Result<Response<Node>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("merge_node", &req.user_id, &req.organization_id)?;
        let result = self.do_merge_node(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn find_nodes(
        &self,
        request: Request<FindNodesRequest>,
    ) -> std::result::Result<Response<FindNodesResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("find_nodes", &req.user_id, &req.organization_id)?;
        let result = self.do_find_nodes(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_relationship(
        &self,
        request: Request<CreateRelationshipRequest>,
    ) -> std::result::Result<Response<Relationship>, Status> {
        let req = request.into_inner();
        let mut scope =
            self.ctx
                .begin("create_relationship", &req.user_id, &req.organization_id)?;
        scope.annotate("rel_type", req.rel_type.as_str());
        let result = self.do_create_relationship(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_relationship(
        &self,
        request: Request<GetRelationshipRequest>,
    ) -> std::result::Result<Response<Relationship>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_relationship", &req.user_id, &req.organization_id)?;
        let result = self.do_get_relationship(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn update_relationship(
        &self,
        request: Request<UpdateRelationshipRequest>,
    ) -> std::result::Result<Response<Relationship>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("update_relationship", &req.user_id, &req.organization_id)?;
        let result = self.do_update_relationship(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_relationship(
        &self,
        request: Request<DeleteRelationshipRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope =
            self.ctx
                .begin("delete_relationship", &req.user_id, &req.organization_id)?;
        scope.annotate("relationship", req.id.to_string());
        let result = self.do_delete_relationship(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn find_relationships(
        &self,
        request: Request<FindRelationshipsRequest>,
    ) -> std::result::Result<Response<FindRelationshipsResponse>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("find_relationships", &req.user_id, &req.organization_id)?;
        let result = self.do_find_relationships(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_path(
        &self,
        request: Request<GetPathRequest>,
    ) -> std::result::Result<Response<Path>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_path", &req.user_id, &req.organization_id)?;
        let result = self.do_get_path(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_shortest_path(
        &self,
        request: Request<GetShortestPathRequest>,
    ) -> std::result::Result<Response<Path>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_shortest_path", &req.user_id, &req.organization_id)?;
        let result = self.do_get_shortest_path(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_neighbors(
        &self,
        request: Request<GetNeighborsRequest>,
    ) -> std::result::Result<Response<GetNeighborsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_neighbors", &req.user_id, &req.organization_id)?;
        let result = self.do_get_neighbors(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let response = match self.graph.run(neo4rs::query("RETURN 1")).await {
            Ok(()) => HealthCheckResponse {
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
