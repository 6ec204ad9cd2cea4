//! Object-store adapter: fronts an S3-compatible backend with the unified
//! gRPC surface, tenant-prefixed bucket names, and streaming object
//! transfer.

use anyhow::Context;

mod backend;
mod lifecycle;
mod service;
mod upload;

pub use service::ObjectStoreService;

/// Operations advertised to service discovery.
const METHODS: &[&str] = &[
    "create_bucket",
    "list_buckets",
    "delete_bucket",
    "get_bucket_info",
    "put_object",
    "get_object",
    "delete_object",
    "delete_objects",
    "list_objects",
    "copy_object",
    "stat_object",
    "get_presigned_url",
    "get_presigned_put_url",
];

#[derive(clap::Parser, Debug)]
#[command(about = "Object-store adapter for the manifold service layer.")]
pub struct Args {
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
    /// Use https towards the backend.
    #[arg(long, env = "MINIO_SECURE", default_value_t = false)]
    pub minio_secure: bool,

    /// Hard cap on a single streamed upload, in bytes.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = 5 * (1 << 40))]
    pub max_upload_bytes: u64,

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
        "minio",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    let s3 = backend::client(&args);
    let service = ObjectStoreService::new(
        runtime.context("minio"),
        s3,
        args.minio_region.clone(),
        args.max_upload_bytes,
    );

    tracing::info!(port = args.service.grpc_port, "object-store adapter listening");

    let server =
        proto_manifold::objectstore::object_store_server::ObjectStoreServer::new(service)
            .max_decoding_message_size(8 * (1 << 20))
            .max_encoding_message_size(8 * (1 << 20));

    tonic::transport::Server::builder()
        .add_service(server)
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    runtime.shutdown().await;
    Ok(())
}
