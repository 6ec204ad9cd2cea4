//! The inbound side of the bridge: subscription management, topic
//! dispatch, status normalization, and HTTP forwarding.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio_util::sync::CancellationToken;

/// Topic patterns subscribed on every (re)connect.
pub const SUBSCRIPTIONS: &[&str] = &[
    "devices/+/telemetry",
    "devices/+/status",
    "devices/+/auth",
    "devices/+/register",
    "notifications/users/+/ack",
    "notifications/system",
];

pub struct Bridge {
    http: reqwest::Client,
    client: AsyncClient,
    telemetry_url: String,
    device_url: String,
    notification_url: String,
    token: String,
}

/// MQTT-style matching with `+` and `#` wildcards.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// The device id is always the second topic segment.
pub fn device_id(topic: &str) -> Option<&str> {
    topic.split('/').nth(1)
}

/// Translate broker status codes into the normalized device-state enum.
pub fn normalize_state(status: &str) -> &'static str {
    match status {
        "online" | "connected" => "active",
        "offline" | "disconnected" => "inactive",
        "error" | "fault" => "error",
        "maintenance" => "maintenance",
        _ => "unknown",
    }
}

/// Device-level metrics carried in status payloads; they move into a
/// `metadata` sub-object so the device service sees a stable shape.
const METRIC_FIELDS: &[&str] = &[
    "battery",
    "rssi",
    "signal_strength",
    "temperature",
    "uptime",
    "firmware_version",
];

/// Split a raw status payload into `(state, body)` where the body carries
/// the normalized status plus a `metadata` sub-object of device metrics.
pub fn normalize_status_payload(payload: &serde_json::Value) -> (String, serde_json::Value) {
    let status = payload
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("unknown");
    let state = normalize_state(status).to_string();

    let mut body = serde_json::Map::new();
    let mut metadata = serde_json::Map::new();
    if let serde_json::Value::Object(fields) = payload {
        for (key, value) in fields {
            if key == "status" {
                continue;
            }
            if METRIC_FIELDS.contains(&key.as_str()) {
                metadata.insert(key.clone(), value.clone());
            } else {
                body.insert(key.clone(), value.clone());
            }
        }
    }
    body.insert("status".to_string(), serde_json::Value::String(state.clone()));
    if !metadata.is_empty() {
        body.insert("metadata".to_string(), serde_json::Value::Object(metadata));
    }
    (state, serde_json::Value::Object(body))
}

impl Bridge {
    pub fn new(args: &crate::Args, client: AsyncClient) -> Self {
        Self {
            http: reqwest::Client::new(),
            client,
            telemetry_url: args.telemetry_service_url.trim_end_matches('/').to_string(),
            device_url: args.device_service_url.trim_end_matches('/').to_string(),
            notification_url: args
                .notification_service_url
                .trim_end_matches('/')
                .to_string(),
            token: args.service_token.clone(),
        }
    }

    async fn subscribe_all(&self) {
        for pattern in SUBSCRIPTIONS {
            if let Err(err) = self.client.subscribe(*pattern, QoS::AtLeastOnce).await {
                tracing::warn!(pattern, error = %err, "subscribe failed");
            }
        }
    }

    /// Drive the broker event loop until cancelled. The SDK reconnects on
    /// its own; this loop re-issues the subscriptions after each ConnAck.
    pub async fn run(self, mut event_loop: EventLoop, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("connected to mqtt broker");
                        self.subscribe_all().await;
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let topic = publish.topic.clone();
                        let payload = publish.payload.to_vec();
                        match self.dispatch(&topic, &payload).await {
                            Ok(()) => (),
                            Err(err) => {
                                tracing::warn!(topic, error = %err, "inbound dispatch failed")
                            }
                        }
                    }
                    Ok(_) => (),
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error; reconnecting");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = cancel.cancelled() => return,
            }
        }
    }

    fn post(&self, url: String, body: serde_json::Value) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url).json(&body).timeout(Duration::from_secs(10));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    fn put(&self, url: String, body: serde_json::Value) -> reqwest::RequestBuilder {
        let mut builder = self.http.put(url).json(&body).timeout(Duration::from_secs(10));
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        builder
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
        let body: serde_json::Value = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::json!({ "raw": String::from_utf8_lossy(payload) })
        });

        if topic_matches("devices/+/telemetry", topic) {
            let id = device_id(topic).unwrap_or_default();
            let mut forwarded = body;
            if let serde_json::Value::Object(map) = &mut forwarded {
                map.insert("device_id".to_string(), serde_json::json!(id));
            }
            self.post(format!("{}/api/v1/telemetry", self.telemetry_url), forwarded)
                .send()
                .await?
                .error_for_status()?;
        } else if topic_matches("devices/+/status", topic) {
            let id = device_id(topic).unwrap_or_default();
            let (_, normalized) = normalize_status_payload(&body);
            self.put(
                format!("{}/api/v1/devices/{id}/status", self.device_url),
                normalized,
            )
            .send()
            .await?
            .error_for_status()?;
        } else if topic_matches("devices/+/auth", topic) {
            let id = device_id(topic).unwrap_or_default().to_string();
            let response = self
                .post(format!("{}/api/v1/devices/{id}/auth", self.device_url), body)
                .send()
                .await?;
            let outcome: serde_json::Value = match response.error_for_status() {
                Ok(response) => response.json().await.unwrap_or_else(|_| {
                    serde_json::json!({ "authorized": true })
                }),
                Err(err) => serde_json::json!({ "authorized": false, "error": err.to_string() }),
            };
            self.client
                .publish(
                    format!("devices/{id}/auth/response"),
                    QoS::AtLeastOnce,
                    false,
                    outcome.to_string(),
                )
                .await?;
        } else if topic_matches("devices/+/register", topic) {
            let id = device_id(topic).unwrap_or_default().to_string();
            let response = self
                .post(format!("{}/api/v1/devices/register", self.device_url), body)
                .send()
                .await?;
            let outcome: serde_json::Value = match response.error_for_status() {
                Ok(response) => response.json().await.unwrap_or_else(|_| {
                    serde_json::json!({ "registered": true })
                }),
                Err(err) => serde_json::json!({ "registered": false, "error": err.to_string() }),
            };
            self.client
                .publish(
                    format!("devices/{id}/register/response"),
                    QoS::AtLeastOnce,
                    false,
                    outcome.to_string(),
                )
                .await?;
        } else if topic_matches("notifications/users/+/ack", topic) {
            let user = topic.split('/').nth(2).unwrap_or_default();
            let mut forwarded = body;
            if let serde_json::Value::Object(map) = &mut forwarded {
                map.insert("user_id".to_string(), serde_json::json!(user));
            }
            self.post(
                format!("{}/api/v1/notifications/ack", self.notification_url),
                forwarded,
            )
            .send()
            .await?
            .error_for_status()?;
        } else if topic_matches("notifications/system", topic) {
            self.post(
                format!("{}/api/v1/notifications/system", self.notification_url),
                body,
            )
            .send()
            .await?
            .error_for_status()?;
        } else {
            tracing::debug!(topic, "unhandled topic");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wildcard_matching_covers_plus_and_hash() {
        assert!(topic_matches("devices/+/telemetry", "devices/d1/telemetry"));
        assert!(!topic_matches("devices/+/telemetry", "devices/d1/status"));
        assert!(!topic_matches("devices/+/telemetry", "devices/d1/extra/telemetry"));
        assert!(topic_matches("devices/#", "devices/d1/anything/below"));
        assert!(topic_matches("notifications/system", "notifications/system"));
        assert!(!topic_matches("notifications/system", "notifications/system/extra"));
    }

    #[test]
    fn device_ids_come_from_the_second_segment() {
        assert_eq!(device_id("devices/d42/status"), Some("d42"));
        assert_eq!(device_id("devices"), None);
    }

    #[test]
    fn broker_states_normalize() {
        assert_eq!(normalize_state("online"), "active");
        assert_eq!(normalize_state("connected"), "active");
        assert_eq!(normalize_state("offline"), "inactive");
        assert_eq!(normalize_state("error"), "error");
        assert_eq!(normalize_state("sideways"), "unknown");
    }

    #[test]
    fn status_payloads_split_metrics_into_metadata() {
        let payload = serde_json::json!({
            "status": "online",
            "battery": 87,
            "rssi": -60,
            "location": "lab-3",
        });
        let (state, body) = normalize_status_payload(&payload);
        assert_eq!(state, "active");
        assert_eq!(body["status"], "active");
        assert_eq!(body["location"], "lab-3");
        assert_eq!(body["metadata"]["battery"], 87);
        assert_eq!(body["metadata"]["rssi"], -60);
        assert!(body.get("battery").is_none());
    }
}
