//! Bootstrap shared by every adapter binary: tracing installation, the
//! Prometheus metrics listener, the audit shipper, discovery registration,
//! and graceful-shutdown signalling.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditSink;
use crate::auth::RequireUserId;
use crate::discovery::{ConsulArgs, Discovery, ServiceRegistration};
use crate::rpc::AdapterContext;

#[derive(clap::Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Overrides the `{adapter}_service` discovery name.
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,
    /// Port the adapter's gRPC server listens on.
    #[arg(long, env = "GRPC_PORT", default_value_t = 50051)]
    pub grpc_port: u16,
    /// Address advertised to service discovery.
    #[arg(long, env = "SERVICE_ADDRESS", default_value = "127.0.0.1")]
    pub service_address: String,
    /// Port for the Prometheus metrics listener.
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}

#[derive(clap::Args, Debug, Clone)]
pub struct AuditArgs {
    /// Push endpoint of the log aggregator; audit shipping is disabled when
    /// unset.
    #[arg(long, env = "LOKI_URL")]
    pub loki_url: Option<String>,
    /// Capacity of the in-memory audit ring buffer.
    #[arg(long, env = "AUDIT_BUFFER", default_value_t = 4096)]
    pub audit_buffer: usize,
}

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => (),
        _ = sigterm.recv() => (),
    }
    tracing::info!("caught signal to exit");
}

fn metrics_router(handle: PrometheusHandle) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route(
            "/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Process-wide runtime shared by all adapter binaries. Owns the audit
/// sink, the discovery registration, and the background tasks that must be
/// stopped during graceful shutdown.
pub struct AdapterRuntime {
    pub audit: AuditSink,
    pub cancel: CancellationToken,
    discovery: Option<(Discovery, String)>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AdapterRuntime {
    pub async fn start(
        adapter: &'static str,
        service: &ServiceArgs,
        consul: &ConsulArgs,
        audit_args: &AuditArgs,
        methods: &[&str],
    ) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        // Metrics listener on its own port, separate from the gRPC surface.
        let prom = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", service.metrics_port)
            .parse()
            .context("parsing metrics address")?;
        let listener = tokio::net::TcpListener::bind(metrics_addr)
            .await
            .context("binding metrics port")?;
        let router = metrics_router(prom);
        let metrics_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                result = axum::serve(listener, router) => {
                    if let Err(err) = result {
                        tracing::error!(%err, "metrics server exited");
                    }
                }
                _ = metrics_cancel.cancelled() => (),
            }
        }));

        let audit = AuditSink::new(audit_args.audit_buffer);
        if let Some(loki_url) = &audit_args.loki_url {
            let shipper = audit.clone().run_shipper(
                loki_url.clone(),
                format!("{adapter}_service"),
                cancel.clone(),
            );
            tasks.push(tokio::spawn(shipper));
        }

        let discovery = if consul.consul_enabled {
            let discovery = Discovery::new(consul);
            let mut registration = ServiceRegistration::for_adapter(
                adapter,
                &service.service_address,
                service.grpc_port,
                env!("CARGO_PKG_VERSION"),
                methods,
            );
            if let Some(name) = &service.service_name {
                registration = registration.with_name(name);
            }
            discovery.register(&registration).await?;
            let id = registration.id.clone();
            tasks.push(tokio::spawn(
                discovery.clone().run_heartbeat(id.clone(), cancel.clone()),
            ));
            Some((discovery, id))
        } else {
            None
        };

        Ok(Self {
            audit,
            cancel,
            discovery,
            tasks,
        })
    }

    /// Build the standard adapter context: default caller validation plus
    /// this runtime's audit sink.
    pub fn context(&self, adapter: &'static str) -> AdapterContext {
        AdapterContext::new(adapter, Arc::new(RequireUserId), self.audit.clone())
    }

    /// Stop heartbeats, deregister, flush the audit buffer, and reap
    /// background tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Some((discovery, id)) = &self.discovery {
            if let Err(err) = discovery.deregister(id).await {
                tracing::warn!(%err, "failed to deregister from service discovery");
            }
        }
        for task in self.tasks {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
        }
    }
}
