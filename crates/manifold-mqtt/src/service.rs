//! The bridge's outbound gRPC surface.

use manifold_core::{AdapterContext, Error, Result};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use proto_manifold::mqtt::mqtt_server::Mqtt;
use proto_manifold::mqtt::{
    PublishBroadcastNotificationRequest, PublishNotificationToUserRequest,
    PublishSystemNotificationRequest, SendCommandToDeviceRequest,
};
use rumqttc::{AsyncClient, QoS};
use tonic::{Request, Response, Status};

pub struct MqttService {
    ctx: AdapterContext,
    client: AsyncClient,
}

impl MqttService {
    pub fn new(ctx: AdapterContext, client: AsyncClient) -> Self {
        Self { ctx, client }
    }

    async fn publish(&self, context: &'static str, topic: String, qos: QoS, payload: String) -> Result<Ack> {
        self.client
            .publish(topic, qos, false, payload)
            .await
            .map_err(|err| Error::Unavailable(format!("{context}: {err}")))?;
        Ok(Ack {})
    }
}

fn qos_from(level: i32) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::InvalidArgument(format!("invalid qos level {other}"))),
    }
}

fn required_json(field: &'static str, json: &str) -> Result<serde_json::Value> {
    if json.is_empty() {
        return Err(Error::InvalidArgument(format!("{field} is required")));
    }
    serde_json::from_str(json)
        .map_err(|err| Error::InvalidArgument(format!("invalid {field}: {err}")))
}

#[tonic::async_trait]
impl Mqtt for MqttService {
    async fn send_command_to_device(
        &self,
        request: Request<SendCommandToDeviceRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope =
            self.ctx
                .begin("send_command_to_device", &req.user_id, &req.organization_id)?;
        scope.annotate("device", req.device_id.as_str());
        let result = async {
            if req.device_id.is_empty() {
                return Err(Error::InvalidArgument("device_id is required".to_string()));
            }
            let command = required_json("command", &req.command_json)?;
            let qos = qos_from(req.qos)?;
            self.publish(
                "send_command_to_device",
                format!("devices/{}/commands", req.device_id),
                qos,
                command.to_string(),
            )
            .await
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish_notification_to_user(
        &self,
        request: Request<PublishNotificationToUserRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin(
            "publish_notification_to_user",
            &req.user_id,
            &req.organization_id,
        )?;
        scope.annotate("target", req.target_user_id.as_str());
        let result = async {
            if req.target_user_id.is_empty() {
                return Err(Error::InvalidArgument(
                    "target_user_id is required".to_string(),
                ));
            }
            let payload = required_json("payload", &req.payload_json)?;
            self.publish(
                "publish_notification_to_user",
                format!("notifications/users/{}", req.target_user_id),
                QoS::AtLeastOnce,
                payload.to_string(),
            )
            .await
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish_broadcast_notification(
        &self,
        request: Request<PublishBroadcastNotificationRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin(
            "publish_broadcast_notification",
            &req.user_id,
            &req.organization_id,
        )?;
        let result = async {
            let payload = required_json("payload", &req.payload_json)?;
            self.publish(
                "publish_broadcast_notification",
                "notifications/broadcast".to_string(),
                QoS::AtLeastOnce,
                payload.to_string(),
            )
            .await
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish_system_notification(
        &self,
        request: Request<PublishSystemNotificationRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin(
            "publish_system_notification",
            &req.user_id,
            &req.organization_id,
        )?;
        scope.annotate("severity", req.severity.as_str());
        let result = async {
            let mut payload = required_json("payload", &req.payload_json)?;
            if let serde_json::Value::Object(map) = &mut payload {
                let severity = if req.severity.is_empty() {
                    "info"
                } else {
                    req.severity.as_str()
                };
                map.insert("severity".to_string(), serde_json::json!(severity));
            }
            self.publish(
                "publish_system_notification",
                "notifications/system".to_string(),
                QoS::AtLeastOnce,
                payload.to_string(),
            )
            .await
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        // A publish to the keep-alive topic doubles as a liveness probe of
        // the broker connection.
        let probe = self
            .client
            .publish("manifold/health", QoS::AtMostOnce, false, "ping")
            .await;
        let response = match probe {
            Ok(()) => HealthCheckResponse {
                healthy: true,
                status: "connected".to_string(),
            },
            Err(err) => HealthCheckResponse {
                healthy: false,
                status: err.to_string(),
            },
        };
        Ok(Response::new(response))
    }
}
