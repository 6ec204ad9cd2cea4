//! Columnar-analytics adapter. The engine is embedded and synchronous, so
//! every backend call runs on the blocking pool behind a connection mutex.
//! Organizations are scoped to `org_{org_id}` schemas; import and export
//! move data between the engine and the per-tenant object-store bucket.

use anyhow::Context;

mod service;
mod sql;

pub use service::AnalyticsService;

const METHODS: &[&str] = &[
    "create_database",
    "list_databases",
    "create_table",
    "execute_query",
    "execute_statement",
    "import_from_object_store",
    "export_to_object_store",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Columnar-analytics adapter for the manifold service layer.")]
pub struct Args {
    /// Directory holding one database file per attached database.
    #[arg(long, env = "DUCKDB_DATA_DIR", default_value = "./duckdb-data")]
    pub duckdb_data_dir: String,
    /// Implicit row cap applied to queries that carry no LIMIT.
    #[arg(long, env = "DUCKDB_MAX_ROWS", default_value_t = 10_000)]
    pub duckdb_max_rows: i64,

    // Object-store endpoint for import/export.
    #[arg(long, env = "MINIO_HOST", default_value = "127.0.0.1")]
    pub minio_host: String,
    #[arg(long, env = "MINIO_PORT", default_value_t = 9000)]
    pub minio_port: u16,
    #[arg(long, env = "MINIO_USER", default_value = "minioadmin")]
    pub minio_user: String,
    #[arg(long, env = "MINIO_PASSWORD", default_value = "minioadmin")]
    pub minio_password: String,
    #[arg(long, env = "MINIO_REGION", default_value = "us-east-1")]
    pub minio_region: String,

    #[command(flatten)]
    pub service: manifold_core::serve::ServiceArgs,
    #[command(flatten)]
    pub consul: manifold_core::discovery::ConsulArgs,
    #[command(flatten)]
    pub audit: manifold_core::serve::AuditArgs,
}

fn s3_client(args: &Args) -> aws_sdk_s3::Client {
    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};

    let credentials = Credentials::new(
        args.minio_user.clone(),
        args.minio_password.clone(),
        None,
        None,
        "static",
    );
    let config = aws_sdk_s3::config::Builder::new()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new(args.minio_region.clone()))
        .endpoint_url(format!("http://{}:{}", args.minio_host, args.minio_port))
        .credentials_provider(credentials)
        .force_path_style(true)
        .build();
    aws_sdk_s3::Client::from_conf(config)
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", args.service.grpc_port)
        .parse()
        .context("parsing gRPC listen address")?;

    let runtime = manifold_core::serve::AdapterRuntime::start(
        "duckdb",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    std::fs::create_dir_all(&args.duckdb_data_dir).context("creating data directory")?;
    let db_path = std::path::Path::new(&args.duckdb_data_dir).join("main.duckdb");
    let connection = duckdb::Connection::open(&db_path).context("opening analytics engine")?;

    let s3 = s3_client(&args);
    let service = AnalyticsService::new(
        runtime.context("duckdb"),
        connection,
        args.duckdb_data_dir.clone(),
        args.duckdb_max_rows,
        s3,
    );

    tracing::info!(port = args.service.grpc_port, "analytics adapter listening");

    tonic::transport::Server::builder()
        .add_service(
            proto_manifold::analytics::analytics_server::AnalyticsServer::new(service),
        )
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
