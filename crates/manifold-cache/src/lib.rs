//! Cache adapter: fronts the key-value cache with tenant-prefixed keys and
//! channels.

use anyhow::Context;

mod backend;
mod service;

pub use service::CacheService;

const METHODS: &[&str] = &[
    "get",
    "set",
    "delete",
    "exists",
    "expire",
    "ttl",
    "increment",
    "decrement",
    "hash_set",
    "hash_get",
    "list_push",
    "list_range",
    "set_add",
    "sorted_set_add",
    "list_keys",
    "publish",
    "subscribe",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Cache adapter for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "REDIS_HOST", default_value = "127.0.0.1")]
    pub redis_host: String,
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,
    #[arg(long, env = "REDIS_PASSWORD", default_value = "")]
    pub redis_password: String,
    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    pub redis_db: u32,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

impl Args {
    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/{}", self.redis_host, self.redis_port, self.redis_db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.redis_password, self.redis_host, self.redis_port, self.redis_db
            )
        }
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.service.grpc_port)
        .parse()
        .context("parsing gRPC listen address")?;

    let runtime = manifold_core::serve::AdapterRuntime::start(
        "redis",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let (pool, client) = backend::connect(&args.redis_url())?;
    let service = CacheService::new(runtime.context("redis"), pool, client);

    tracing::info!(port = args.service.grpc_port, "cache adapter listening");

    tonic::transport::Server::builder()
        .add_service(proto_manifold::cache::cache_server::CacheServer::new(
            service,
        ))
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
