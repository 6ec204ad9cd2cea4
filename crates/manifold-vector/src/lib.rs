//! Vector-search adapter. Collection names pass through unchanged; tenant
//! isolation rides on an owner tag written into every point's payload and
//! a mandatory owner filter injected into every read and write.

use anyhow::Context;

mod convert;
mod service;

pub use service::VectorService;

const METHODS: &[&str] = &[
    "create_collection",
    "delete_collection",
    "list_collections",
    "get_collection_info",
    "upsert_points",
    "get_points",
    "delete_points",
    "search",
    "search_batch",
    "recommend",
    "scroll",
    "create_snapshot",
    "list_snapshots",
    "delete_snapshot",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Vector-search adapter for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "QDRANT_HOST", default_value = "127.0.0.1")]
    pub qdrant_host: String,
    #[arg(long, env = "QDRANT_PORT", default_value_t = 6334)]
    pub qdrant_port: u16,
    #[arg(long, env = "QDRANT_API_KEY", default_value = "")]
    pub qdrant_api_key: String,

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
        "qdrant",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let url = format!("http://{}:{}", args.qdrant_host, args.qdrant_port);
    let mut builder = qdrant_client::Qdrant::from_url(&url);
    if !args.qdrant_api_key.is_empty() {
        builder = builder.api_key(args.qdrant_api_key.clone());
    }
    let client = builder.build().context("building vector-search client")?;

    let service = VectorService::new(runtime.context("qdrant"), client);

    tracing::info!(port = args.service.grpc_port, "vector-search adapter listening");

    tonic::transport::Server::builder()
        .add_service(
            proto_manifold::vector::vector_search_server::VectorSearchServer::new(service),
        )
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
