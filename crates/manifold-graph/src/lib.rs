//! Graph adapter. Every write stamps a tenant property onto the created
//! node or relationship and every read filters on it, so ids leaked
//! across tenants dereference to nothing.

use anyhow::Context;

mod cypher;
mod service;

pub use service::GraphService;

const METHODS: &[&str] = &[
    "run_cypher",
    "run_cypher_read",
    "run_cypher_write",
    "run_cypher_batch",
    "create_node",
    "get_node",
    "update_node",
    "delete_node",
    "merge_node",
    "find_nodes",
    "create_relationship",
    "get_relationship",
    "delete_relationship",
    "find_relationships",
    "get_path",
    "get_shortest_path",
    "get_neighbors",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Graph adapter for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "NEO4J_HOST", default_value = "127.0.0.1")]
    pub neo4j_host: String,
    #[arg(long, env = "NEO4J_PORT", default_value_t = 7687)]
    pub neo4j_port: u16,
    #[arg(long, env = "NEO4J_USER", default_value = "neo4j")]
    pub neo4j_user: String,
    #[arg(long, env = "NEO4J_PASSWORD", default_value = "neo4j")]
    pub neo4j_password: String,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.service.grpc_port)
        .parse()
        .context("parsing gRPC listen address")?;

    let runtime = manifold_core::serve::AdapterRuntime::start(
        "neo4j",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let uri = format!("bolt://{}:{}", args.neo4j_host, args.neo4j_port);
    let graph = neo4rs::Graph::new(&uri, &args.neo4j_user, &args.neo4j_password)
        .await
        .context("connecting to graph backend")?;
    let service = GraphService::new(runtime.context("neo4j"), graph);

    tracing::info!(port = args.service.grpc_port, "graph adapter listening");

    tonic::transport::Server::builder()
        .add_service(proto_manifold::graph::graph_server::GraphServer::new(
            service,
        ))
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
