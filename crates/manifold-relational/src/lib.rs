//! Relational/vector-database adapter. Every row carries an
//! `owner_user_id` column and every WHERE clause the adapter builds is
//! scoped to the caller, so rows never leak across tenants.

use anyhow::Context;

mod service;
mod sqlgen;

pub use service::RelationalService;

const METHODS: &[&str] = &[
    "query",
    "insert",
    "update",
    "delete",
    "upsert",
    "execute_rpc",
    "batch_insert",
    "upsert_embedding",
    "batch_upsert_embeddings",
    "similarity_search",
    "hybrid_search",
    "delete_embedding",
    "begin_transaction",
    "commit_transaction",
    "rollback_transaction",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Relational/vector-database adapter for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "SUPABASE_HOST", default_value = "127.0.0.1")]
    pub supabase_host: String,
    #[arg(long, env = "SUPABASE_PORT", default_value_t = 5432)]
    pub supabase_port: u16,
    #[arg(long, env = "SUPABASE_USER", default_value = "postgres")]
    pub supabase_user: String,
    #[arg(long, env = "SUPABASE_PASSWORD", default_value = "postgres")]
    pub supabase_password: String,
    #[arg(long, env = "SUPABASE_DB", default_value = "postgres")]
    pub supabase_db: String,
    #[arg(long, env = "SUPABASE_POOL_SIZE", default_value_t = 10)]
    pub supabase_pool_size: u32,

    /// Open transactions are rolled back after this many seconds.
    #[arg(long, env = "TRANSACTION_TIMEOUT_SECONDS", default_value_t = 60)]
    pub transaction_timeout_seconds: u64,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

impl Args {
    fn database_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.supabase_user,
            self.supabase_password,
            self.supabase_host,
            self.supabase_port,
            self.supabase_db,
        )
    }
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.service.grpc_port)
        .parse()
        .context("parsing gRPC listen address")?;

    let runtime = manifold_core::serve::AdapterRuntime::start(
        "supabase",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(args.supabase_pool_size)
        .connect(&args.database_url())
        .await
        .context("connecting to relational backend")?;

    let service = RelationalService::new(
        runtime.context("supabase"),
        pool,
        std::time::Duration::from_secs(args.transaction_timeout_seconds),
    );

    tracing::info!(port = args.service.grpc_port, "relational adapter listening");

    tonic::transport::Server::builder()
        .add_service(
            proto_manifold::relational::relational_server::RelationalServer::new(service),
        )
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
