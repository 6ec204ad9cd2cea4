//! MQTT bridge. Holds one long-lived client to the external broker,
//! forwards inbound device traffic to the downstream HTTP services, and
//! exposes a small gRPC surface for outbound publishing.

use anyhow::Context;
use std::time::Duration;

mod bridge;
mod service;

pub use bridge::Bridge;
pub use service::MqttService;

const METHODS: &[&str] = &[
    "send_command_to_device",
    "publish_notification_to_user",
    "publish_broadcast_notification",
    "publish_system_notification",
];

#[derive(clap::Parser, Debug)]
#[command(about = "MQTT bridge for the manifold service layer.")]
pub struct Args {
    #[arg(long, env = "MQTT_HOST", default_value = "127.0.0.1")]
    pub mqtt_host: String,
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,
    #[arg(long, env = "MQTT_USER", default_value = "")]
    pub mqtt_user: String,
    #[arg(long, env = "MQTT_PASSWORD", default_value = "")]
    pub mqtt_password: String,

    /// Base URL of the telemetry ingestion service.
    #[arg(long, env = "TELEMETRY_SERVICE_URL", default_value = "http://127.0.0.1:8100")]
    pub telemetry_service_url: String,
    /// Base URL of the device management service.
    #[arg(long, env = "DEVICE_SERVICE_URL", default_value = "http://127.0.0.1:8101")]
    pub device_service_url: String,
    /// Base URL of the notification service.
    #[arg(long, env = "NOTIFICATION_SERVICE_URL", default_value = "http://127.0.0.1:8102")]
    pub notification_service_url: String,
    /// Service-to-service bearer token for the downstream HTTP calls.
    #[arg(long, env = "MQTT_SERVICE_TOKEN", default_value = "")]
    pub service_token: String,

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
        "mqtt",
        &args.service,
        &args.consul,
        &args.audit,
        METHODS,
    )
    .await?;

    // One unique client id per process; the broker drops the older session
    // when ids collide.
    let client_id = format!("manifold-mqtt-{}", uuid::Uuid::new_v4());
    let mut options = rumqttc::MqttOptions::new(client_id, args.mqtt_host.clone(), args.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    if !args.mqtt_user.is_empty() {
        options.set_credentials(args.mqtt_user.clone(), args.mqtt_password.clone());
    }
    let (client, event_loop) = rumqttc::AsyncClient::new(options, 64);

    let bridge = Bridge::new(&args, client.clone());
    let bridge_task = tokio::spawn(bridge.run(event_loop, runtime.cancel.clone()));

    let service = MqttService::new(runtime.context("mqtt"), client.clone());

    tracing::info!(port = args.service.grpc_port, "mqtt bridge listening");

    tonic::transport::Server::builder()
        .add_service(proto_manifold::mqtt::mqtt_server::MqttServer::new(service))
        .serve_with_shutdown(addr, manifold_core::serve::shutdown_signal())
        .await
        .context("serving gRPC")?;

    let _ = client.disconnect().await;
    runtime.shutdown().await;
    let _ = bridge_task.await;
    Ok(())
}
