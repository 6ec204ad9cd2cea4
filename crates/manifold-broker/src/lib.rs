//! Broker adapter: fronts the message broker's core pub/sub, persistent
//! streams, and pull consumers. Its key-value and object sub-APIs delegate
//! over gRPC to the cache and object-store adapters, so the tenant prefix
//! rules compose and the sub-APIs behave exactly like their primary
//! counterparts.

use anyhow::Context;

mod backend;
mod delegate;
mod service;

pub use service::BrokerService;

const METHODS: &[&str] = &[
    "publish",
    "publish_batch",
    "subscribe",
    "queue_subscribe",
    "request",
    "create_stream",
    "delete_stream",
    "list_streams",
    "purge_stream",
    "create_consumer",
    "pull_messages",
    "ack_message",
    "publish_to_stream",
    "kv_put",
    "kv_get",
    "object_put",
    "object_get",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Message-broker adapter for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "NATS_HOST", default_value = "127.0.0.1")]
    pub nats_host: String,
    #[arg(long, env = "NATS_PORT", default_value_t = 4222)]
    pub nats_port: u16,
    #[arg(long, env = "NATS_USER", default_value = "")]
    pub nats_user: String,
    #[arg(long, env = "NATS_PASSWORD", default_value = "")]
    pub nats_password: String,

    /// gRPC endpoint of the cache adapter backing the KV sub-API.
    #[arg(long, env = "CACHE_ADAPTER_URL", default_value = "http://127.0.0.1:50052")]
    pub cache_adapter_url: String,
    /// gRPC endpoint of the object-store adapter backing the object sub-API.
    #[arg(long, env = "OBJECT_ADAPTER_URL", default_value = "http://127.0.0.1:50051")]
    pub object_adapter_url: String,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

impl Args {
    pub fn nats_url(&self) -> String {
        format!("nats://{}:{}", self.nats_host, self.nats_port)
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.service.grpc_port)
        .parse()
        .context("parsing gRPC listen address")?;

    let runtime = manifold_core::serve::AdapterRuntime::start(
        "nats",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let client = backend::connect(&args).await?;
    let siblings = delegate::Siblings::connect(&args.cache_adapter_url, &args.object_adapter_url)?;
    let service = BrokerService::new(runtime.context("nats"), client, siblings);

    tracing::info!(port = args.service.grpc_port, "broker adapter listening");

    tonic::transport::Server::builder()
        .add_service(proto_manifold::broker::broker_server::BrokerServer::new(
            service,
        ))
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
