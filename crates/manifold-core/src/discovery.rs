//! Service discovery against a Consul agent.
//!
//! Adapters register on startup with a TTL health check, emit heartbeats at
//! half the TTL, and deregister on shutdown. Registration is deliberately a
//! thin HTTP client rather than a backend SDK; the agent API is stable and
//! this keeps the discovery surface identical across adapters.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// TTL reported to the agent. Heartbeats run at half this interval.
pub const CHECK_TTL: Duration = Duration::from_secs(15);

#[derive(clap::Args, Debug, Clone)]
pub struct ConsulArgs {
    /// Whether to register with service discovery at all.
    #[arg(long, env = "CONSUL_ENABLED", default_value_t = false)]
    pub consul_enabled: bool,
    #[arg(long, env = "CONSUL_HOST", default_value = "127.0.0.1")]
    pub consul_host: String,
    #[arg(long, env = "CONSUL_PORT", default_value_t = 8500)]
    pub consul_port: u16,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceRegistration {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "Meta")]
    pub meta: BTreeMap<String, String>,
    #[serde(rename = "Check")]
    check: TtlCheck,
}

#[derive(Debug, Clone, serde::Serialize)]
struct TtlCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

impl ServiceRegistration {
    /// Build the registration for an adapter following the
    /// `{adapter}_service` naming convention, with the id
    /// `{service}-{hostname}`.
    pub fn for_adapter(
        adapter: &str,
        address: &str,
        port: u16,
        version: &str,
        methods: &[&str],
    ) -> Self {
        let name = format!("{adapter}_service");
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let id = format!("{name}-{host}");

        let mut meta = BTreeMap::new();
        meta.insert("base_path".to_string(), format!("/api/v1/infra/{adapter}"));
        meta.insert("capabilities".to_string(), "grpc".to_string());
        meta.insert("version".to_string(), version.to_string());
        meta.insert("health".to_string(), "ttl".to_string());
        meta.insert("methods".to_string(), methods.join(","));

        let check = TtlCheck {
            check_id: format!("service:{id}"),
            ttl: format!("{}s", CHECK_TTL.as_secs()),
            deregister_after: "1m".to_string(),
        };

        Self {
            name,
            id,
            address: address.to_string(),
            port,
            tags: vec!["manifold".to_string(), "grpc".to_string()],
            meta,
            check,
        }
    }

    /// Replace the derived service name (the `SERVICE_NAME` override),
    /// recomputing the id and check id that embed it.
    pub fn with_name(mut self, name: &str) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        self.name = name.to_string();
        self.id = format!("{name}-{host}");
        self.check.check_id = format!("service:{}", self.id);
        self
    }
}

#[derive(Clone)]
pub struct Discovery {
    http: reqwest::Client,
    base: String,
}

impl Discovery {
    pub fn new(args: &ConsulArgs) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://{}:{}", args.consul_host, args.consul_port),
        }
    }

    pub async fn register(&self, registration: &ServiceRegistration) -> anyhow::Result<()> {
        self.http
            .put(format!("{}/v1/agent/service/register", self.base))
            .json(registration)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("registering service with consul")?;
        tracing::info!(
            service = %registration.name,
            id = %registration.id,
            "registered with service discovery"
        );
        Ok(())
    }

    pub async fn pass(&self, service_id: &str) -> anyhow::Result<()> {
        self.http
            .put(format!(
                "{}/v1/agent/check/pass/service:{service_id}",
                self.base
            ))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("passing consul TTL check")?;
        Ok(())
    }

    pub async fn deregister(&self, service_id: &str) -> anyhow::Result<()> {
        self.http
            .put(format!(
                "{}/v1/agent/service/deregister/{service_id}",
                self.base
            ))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context("deregistering service from consul")?;
        tracing::info!(id = %service_id, "deregistered from service discovery");
        Ok(())
    }

    /// Heartbeat loop. Runs until cancelled; failures are logged and
    /// retried on the next tick.
    pub async fn run_heartbeat(self, service_id: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(CHECK_TTL / 2);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.pass(&service_id).await {
                        tracing::warn!(%err, id = %service_id, "consul heartbeat failed");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_follows_naming_convention() {
        let reg = ServiceRegistration::for_adapter("minio", "10.0.0.5", 50051, "0.0.0", &["create_bucket"]);
        assert_eq!(reg.name, "minio_service");
        assert!(reg.id.starts_with("minio_service-"));
        assert_eq!(reg.meta.get("base_path").unwrap(), "/api/v1/infra/minio");
        assert_eq!(reg.check.check_id, format!("service:{}", reg.id));
        assert_eq!(reg.check.ttl, "15s");
    }

    #[test]
    fn registration_serializes_consul_field_names() {
        let reg = ServiceRegistration::for_adapter("redis", "127.0.0.1", 50052, "0.0.0", &[]);
        let json = serde_json::to_value(&reg).unwrap();
        assert_eq!(json["Name"], "redis_service");
        assert_eq!(json["Port"], 50052);
        assert!(json["Check"]["TTL"].as_str().unwrap().ends_with('s'));
    }
}
