//! The broker gRPC service.
//!
//! Subjects and stream names are tenant-prefixed on the way in and
//! stripped on the way out. Message order is whatever the backend
//! delivers; the adapter never buffers-and-reorders.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_nats::jetstream;
use async_nats::jetstream::consumer::PullConsumer;
use futures::{Stream, StreamExt, TryStreamExt};
use manifold_core::{tenant, AdapterContext, Error, Result};
use proto_manifold::broker::broker_server::Broker;
use proto_manifold::broker::{
    AckMessageRequest, ConsumerConfig, ConsumerInfo, CreateConsumerRequest, CreateStreamRequest,
    DeleteConsumerRequest, DeleteStreamRequest, GetConsumerInfoRequest, GetStatisticsRequest,
    GetStatisticsResponse, GetStreamInfoRequest, GetStreamStatsRequest, KvDeleteRequest,
    KvGetRequest, KvGetResponse, KvKeysRequest, KvKeysResponse, KvPutRequest, KvPutResponse,
    ListConsumersRequest, ListConsumersResponse, ListStreamsRequest, ListStreamsResponse,
    Message, NakMessageRequest, ObjectDeleteRequest, ObjectGetRequest, ObjectGetResponse,
    ObjectListRequest, ObjectListResponse, ObjectPutRequest, ObjectPutResponse,
    PublishBatchRequest, PublishBatchResponse, PublishRequest, PublishToStreamRequest,
    PublishToStreamResponse, PullMessagesRequest, PullMessagesResponse, PurgeStreamRequest,
    PurgeStreamResponse, QueueSubscribeRequest, RequestRequest, RequestResponse, StreamConfig,
    StreamInfo, StreamStats, SubscribeRequest, UnsubscribeRequest, UpdateStreamRequest,
};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status};

use crate::backend;
use crate::delegate::Siblings;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PULL_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_PULL_BATCH: usize = 10;

pub struct BrokerService {
    ctx: AdapterContext,
    client: async_nats::Client,
    jetstream: jetstream::Context,
    siblings: Siblings,
}

impl BrokerService {
    pub fn new(ctx: AdapterContext, client: async_nats::Client, siblings: Siblings) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            ctx,
            client,
            jetstream,
            siblings,
        }
    }
}

fn required(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        Err(Error::InvalidArgument(format!("{field} is required")))
    } else {
        Ok(())
    }
}

fn headers_to_map(headers: Option<&async_nats::HeaderMap>) -> HashMap<String, String> {
    let Some(headers) = headers else {
        return HashMap::new();
    };
    headers
        .iter()
        .map(|(name, values)| {
            (
                name.to_string(),
                values
                    .first()
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            )
        })
        .collect()
}

fn map_to_headers(map: &HashMap<String, String>) -> async_nats::HeaderMap {
    let mut headers = async_nats::HeaderMap::new();
    for (name, value) in map {
        headers.insert(name.as_str(), value.as_str());
    }
    headers
}

fn unix_millis(ts: time::OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

fn core_to_proto(user_id: &str, message: async_nats::Message) -> Message {
    let subject = tenant::strip_subject(user_id, message.subject.as_str())
        .unwrap_or_else(|| message.subject.to_string());
    Message {
        subject,
        data: message.payload.to_vec(),
        headers: headers_to_map(message.headers.as_ref()),
        sequence: 0,
        timestamp: 0,
        ack_subject: String::new(),
    }
}

fn js_to_proto(user_id: &str, message: &jetstream::Message) -> Message {
    let (sequence, timestamp) = match message.info() {
        Ok(info) => (info.stream_sequence, unix_millis(info.published)),
        Err(_) => (0, 0),
    };
    let subject = tenant::strip_subject(user_id, message.subject.as_str())
        .unwrap_or_else(|| message.subject.to_string());
    Message {
        subject,
        data: message.payload.to_vec(),
        headers: headers_to_map(message.headers.as_ref()),
        sequence,
        timestamp,
        ack_subject: message
            .reply
            .as_ref()
            .map(|r| r.to_string())
            .unwrap_or_default(),
    }
}

fn build_stream_config(user_id: &str, config: &StreamConfig) -> Result<jetstream::stream::Config> {
    required("stream name", &config.name)?;
    if config.subjects.is_empty() {
        return Err(Error::InvalidArgument("subjects is required".to_string()));
    }
    Ok(jetstream::stream::Config {
        name: tenant::stream(user_id, &config.name),
        subjects: config
            .subjects
            .iter()
            .map(|s| tenant::subject(user_id, s))
            .collect(),
        storage: backend::storage_type(&config.storage)?,
        max_messages: if config.max_msgs > 0 { config.max_msgs } else { -1 },
        max_bytes: if config.max_bytes > 0 { config.max_bytes } else { -1 },
        max_age: if config.max_age_seconds > 0 {
            Duration::from_secs(config.max_age_seconds as u64)
        } else {
            Duration::ZERO
        },
        max_message_size: if config.max_msg_size > 0 {
            config.max_msg_size
        } else {
            -1
        },
        num_replicas: if config.replicas > 0 {
            config.replicas as usize
        } else {
            1
        },
        discard: backend::discard_policy(&config.discard_policy)?,
        ..Default::default()
    })
}

fn stream_info_to_proto(user_id: &str, info: &jetstream::stream::Info) -> StreamInfo {
    let logical_name = tenant::strip_stream(user_id, &info.config.name)
        .unwrap_or_else(|| info.config.name.clone());
    let prefix = format!("user.{user_id}.");
    let subjects = info
        .config
        .subjects
        .iter()
        .map(|s| {
            s.strip_prefix(prefix.as_str())
                .map(str::to_owned)
                .unwrap_or_else(|| s.to_string())
        })
        .collect();

    StreamInfo {
        config: Some(StreamConfig {
            name: logical_name,
            subjects,
            storage: backend::storage_name(info.config.storage).to_string(),
            max_msgs: info.config.max_messages,
            max_bytes: info.config.max_bytes,
            max_age_seconds: info.config.max_age.as_secs() as i64,
            max_msg_size: info.config.max_message_size,
            replicas: info.config.num_replicas as i32,
            discard_policy: backend::discard_name(info.config.discard).to_string(),
        }),
        messages: info.state.messages,
        bytes: info.state.bytes,
        first_sequence: info.state.first_sequence,
        last_sequence: info.state.last_sequence,
        consumer_count: info.state.consumer_count as i32,
        created: unix_millis(info.created),
    }
}

fn consumer_info_to_proto(user_id: &str, info: &jetstream::consumer::Info) -> ConsumerInfo {
    let prefix = format!("user.{user_id}.");
    let filter_subject = info
        .config
        .filter_subject
        .strip_prefix(prefix.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| info.config.filter_subject.clone());

    ConsumerInfo {
        stream: tenant::strip_stream(user_id, &info.stream_name)
            .unwrap_or_else(|| info.stream_name.clone()),
        config: Some(ConsumerConfig {
            name: info.name.clone(),
            durable_name: info.config.durable_name.clone().unwrap_or_default(),
            filter_subject,
            deliver_policy: backend::deliver_name(&info.config.deliver_policy).to_string(),
            ack_policy: backend::ack_name(info.config.ack_policy).to_string(),
            ack_wait_seconds: info.config.ack_wait.as_secs() as i64,
            max_deliver: info.config.max_deliver,
            replay_policy: backend::replay_name(info.config.replay_policy).to_string(),
            opt_start_seq: match info.config.deliver_policy {
                jetstream::consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
                    start_sequence
                }
                _ => 0,
            },
        }),
        num_pending: info.num_pending,
        num_ack_pending: info.num_ack_pending as u64,
        delivered_stream_sequence: info.delivered.stream_sequence,
    }
}

impl BrokerService {
    async fn get_stream(&self, user_id: &str, logical: &str) -> Result<jetstream::stream::Stream> {
        required("stream", logical)?;
        self.jetstream
            .get_stream(tenant::stream(user_id, logical))
            .await
            .map_err(|err| backend::classify("get_stream", err))
    }

    async fn do_publish(&self, req: PublishRequest) -> Result<Ack> {
        required("subject", &req.subject)?;
        let subject = tenant::subject(&req.user_id, &req.subject);
        let payload = bytes::Bytes::from(req.data);
        let result = if req.headers.is_empty() {
            self.client.publish(subject, payload).await
        } else {
            self.client
                .publish_with_headers(subject, map_to_headers(&req.headers), payload)
                .await
        };
        result.map_err(|err| backend::classify("publish", err))?;
        Ok(Ack {})
    }

    async fn do_publish_batch(&self, req: PublishBatchRequest) -> Result<PublishBatchResponse> {
        use proto_manifold::broker::publish_batch_response::Failure;

        if req.entries.is_empty() {
            return Err(Error::InvalidArgument("entries is required".to_string()));
        }

        let mut published = 0;
        let mut failures = Vec::new();
        for (index, entry) in req.entries.iter().enumerate() {
            if entry.subject.is_empty() {
                failures.push(Failure {
                    index: index as i32,
                    subject: entry.subject.clone(),
                    error: "subject is required".to_string(),
                });
                continue;
            }
            let subject = tenant::subject(&req.user_id, &entry.subject);
            match self
                .client
                .publish(subject, bytes::Bytes::from(entry.data.clone()))
                .await
            {
                Ok(()) => published += 1,
                Err(err) => failures.push(Failure {
                    index: index as i32,
                    subject: entry.subject.clone(),
                    error: backend::classify("publish_batch", err).to_string(),
                }),
            }
        }

        Ok(PublishBatchResponse {
            published,
            failures,
        })
    }

    async fn subscription_stream(
        &self,
        user_id: String,
        subject: String,
        queue_group: Option<String>,
    ) -> Result<Pin<Box<dyn Stream<Item = std::result::Result<Message, Status>> + Send>>> {
        required("subject", &subject)?;
        let physical = tenant::subject(&user_id, &subject);

        let mut subscriber = match queue_group {
            Some(group) => {
                required("queue_group", &group)?;
                self.client
                    .queue_subscribe(physical, group)
                    .await
                    .map_err(|err| backend::classify("queue_subscribe", err))?
            }
            None => self
                .client
                .subscribe(physical)
                .await
                .map_err(|err| backend::classify("subscribe", err))?,
        };

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            // The delivery loop ends when the client cancels its stream;
            // dropping the subscriber unsubscribes from the backend.
            while let Some(message) = subscriber.next().await {
                let out = core_to_proto(&user_id, message);
                if tx.send(Ok(out)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn do_request(&self, req: RequestRequest) -> Result<RequestResponse> {
        required("subject", &req.subject)?;
        let subject = tenant::subject(&req.user_id, &req.subject);
        let timeout = backend::effective_timeout(req.timeout_ms, DEFAULT_REQUEST_TIMEOUT);

        let response = tokio::time::timeout(
            timeout,
            self.client.request(subject, bytes::Bytes::from(req.data)),
        )
        .await
        .map_err(|_| {
            Error::DeadlineExceeded(format!(
                "request: no reply within {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|err| backend::classify("request", err))?;

        Ok(RequestResponse {
            data: response.payload.to_vec(),
            headers: headers_to_map(response.headers.as_ref()),
        })
    }

    async fn do_create_stream(&self, req: CreateStreamRequest) -> Result<StreamInfo> {
        let config = req
            .config
            .ok_or_else(|| Error::InvalidArgument("config is required".to_string()))?;
        let backend_config = build_stream_config(&req.user_id, &config)?;

        let mut stream = self
            .jetstream
            .create_stream(backend_config)
            .await
            .map_err(|err| backend::classify("create_stream", err))?;
        let info = stream
            .info()
            .await
            .map_err(|err| backend::classify("create_stream", err))?;
        Ok(stream_info_to_proto(&req.user_id, info))
    }

    async fn do_update_stream(&self, req: UpdateStreamRequest) -> Result<StreamInfo> {
        let config = req
            .config
            .ok_or_else(|| Error::InvalidArgument("config is required".to_string()))?;
        let backend_config = build_stream_config(&req.user_id, &config)?;

        let info = self
            .jetstream
            .update_stream(&backend_config)
            .await
            .map_err(|err| backend::classify("update_stream", err))?;
        Ok(stream_info_to_proto(&req.user_id, &info))
    }

    async fn do_get_stream_info(&self, req: GetStreamInfoRequest) -> Result<StreamInfo> {
        let mut stream = self.get_stream(&req.user_id, &req.stream).await?;
        let info = stream
            .info()
            .await
            .map_err(|err| backend::classify("get_stream_info", err))?;
        Ok(stream_info_to_proto(&req.user_id, info))
    }

    async fn do_list_streams(&self, req: ListStreamsRequest) -> Result<ListStreamsResponse> {
        let prefix = format!("user-{}-", req.user_id);
        let mut streams = Vec::new();
        let mut pager = self.jetstream.streams();
        while let Some(info) = pager
            .try_next()
            .await
            .map_err(|err| backend::classify("list_streams", err))?
        {
            if info.config.name.starts_with(&prefix) {
                streams.push(stream_info_to_proto(&req.user_id, &info));
            }
        }
        Ok(ListStreamsResponse { streams })
    }

    async fn do_purge_stream(&self, req: PurgeStreamRequest) -> Result<PurgeStreamResponse> {
        let stream = self.get_stream(&req.user_id, &req.stream).await?;
        let response = stream
            .purge()
            .await
            .map_err(|err| backend::classify("purge_stream", err))?;
        Ok(PurgeStreamResponse {
            purged: response.purged,
        })
    }

    async fn do_create_consumer(&self, req: CreateConsumerRequest) -> Result<ConsumerInfo> {
        let stream = self.get_stream(&req.user_id, &req.stream).await?;
        let config = req
            .config
            .ok_or_else(|| Error::InvalidArgument("config is required".to_string()))?;
        required("consumer name", &config.name)?;

        let filter_subject = if config.filter_subject.is_empty() {
            String::new()
        } else {
            tenant::subject(&req.user_id, &config.filter_subject)
        };

        let backend_config = jetstream::consumer::pull::Config {
            name: Some(config.name.clone()),
            durable_name: if config.durable_name.is_empty() {
                None
            } else {
                Some(config.durable_name.clone())
            },
            filter_subject,
            deliver_policy: backend::deliver_policy(&config.deliver_policy, config.opt_start_seq)?,
            ack_policy: backend::ack_policy(&config.ack_policy)?,
            ack_wait: if config.ack_wait_seconds > 0 {
                Duration::from_secs(config.ack_wait_seconds as u64)
            } else {
                Duration::from_secs(30)
            },
            max_deliver: if config.max_deliver > 0 {
                config.max_deliver
            } else {
                -1
            },
            replay_policy: backend::replay_policy(&config.replay_policy)?,
            ..Default::default()
        };

        let mut consumer = stream
            .create_consumer(backend_config)
            .await
            .map_err(|err| backend::classify("create_consumer", err))?;
        let info = consumer
            .info()
            .await
            .map_err(|err| backend::classify("create_consumer", err))?;
        Ok(consumer_info_to_proto(&req.user_id, info))
    }

    async fn do_get_consumer_info(&self, req: GetConsumerInfoRequest) -> Result<ConsumerInfo> {
        let stream = self.get_stream(&req.user_id, &req.stream).await?;
        required("consumer", &req.consumer)?;
        let mut consumer: PullConsumer = stream
            .get_consumer(&req.consumer)
            .await
            .map_err(|err| backend::classify("get_consumer_info", err))?;
        let info = consumer
            .info()
            .await
            .map_err(|err| backend::classify("get_consumer_info", err))?;
        Ok(consumer_info_to_proto(&req.user_id, info))
    }

    async fn do_list_consumers(&self, req: ListConsumersRequest) -> Result<ListConsumersResponse> {
        let stream = self.get_stream(&req.user_id, &req.stream).await?;

        let mut names = Vec::new();
        let mut pager = stream.consumer_names();
        while let Some(name) = pager
            .try_next()
            .await
            .map_err(|err| backend::classify("list_consumers", err))?
        {
            names.push(name);
        }

        let mut consumers = Vec::new();
        for name in names {
            let mut consumer: PullConsumer = stream
                .get_consumer(&name)
                .await
                .map_err(|err| backend::classify("list_consumers", err))?;
            let info = consumer
                .info()
                .await
                .map_err(|err| backend::classify("list_consumers", err))?;
            consumers.push(consumer_info_to_proto(&req.user_id, info));
        }
        Ok(ListConsumersResponse { consumers })
    }

    async fn do_pull_messages(&self, req: PullMessagesRequest) -> Result<PullMessagesResponse> {
        let stream = self.get_stream(&req.user_id, &req.stream).await?;
        required("consumer", &req.consumer)?;
        let consumer: PullConsumer = stream
            .get_consumer(&req.consumer)
            .await
            .map_err(|err| backend::classify("pull_messages", err))?;

        let batch = if req.batch_size <= 0 {
            DEFAULT_PULL_BATCH
        } else {
            req.batch_size as usize
        };
        let expires = backend::effective_timeout(req.max_wait_ms, DEFAULT_PULL_WAIT);

        let mut fetched = consumer
            .fetch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|err| backend::classify("pull_messages", err))?;

        let mut messages = Vec::new();
        loop {
            match fetched.next().await {
                Some(Ok(message)) => messages.push(js_to_proto(&req.user_id, &message)),
                Some(Err(err)) => {
                    // Return what we have; the fetch window may simply have
                    // closed under us.
                    tracing::debug!(error = %err, "pull fetch ended with error");
                    break;
                }
                None => break,
            }
        }
        Ok(PullMessagesResponse { messages })
    }

    async fn do_ack(&self, context: &'static str, ack_subject: &str, payload: &'static str) -> Result<Ack> {
        if ack_subject.is_empty() {
            return Err(Error::InvalidArgument(
                "ack_subject from the delivered message is required".to_string(),
            ));
        }
        self.client
            .publish(ack_subject.to_string(), bytes::Bytes::from_static(payload.as_bytes()))
            .await
            .map_err(|err| backend::classify(context, err))?;
        Ok(Ack {})
    }

    async fn do_publish_to_stream(
        &self,
        req: PublishToStreamRequest,
    ) -> Result<PublishToStreamResponse> {
        required("subject", &req.subject)?;
        let subject = tenant::subject(&req.user_id, &req.subject);
        let payload = bytes::Bytes::from(req.data);

        let future = if req.headers.is_empty() {
            self.jetstream.publish(subject, payload).await
        } else {
            self.jetstream
                .publish_with_headers(subject, map_to_headers(&req.headers), payload)
                .await
        }
        .map_err(|err| backend::classify("publish_to_stream", err))?;

        let ack = future
            .await
            .map_err(|err| backend::classify("publish_to_stream", err))?;

        Ok(PublishToStreamResponse {
            sequence: ack.sequence,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    async fn do_get_statistics(&self, req: GetStatisticsRequest) -> Result<GetStatisticsResponse> {
        let prefix = format!("user-{}-", req.user_id);
        let mut streams: i64 = 0;
        let mut consumers: i64 = 0;
        let mut messages: u64 = 0;
        let mut bytes: u64 = 0;

        let mut pager = self.jetstream.streams();
        while let Some(info) = pager
            .try_next()
            .await
            .map_err(|err| backend::classify("get_statistics", err))?
        {
            if !info.config.name.starts_with(&prefix) {
                continue;
            }
            streams += 1;
            consumers += info.state.consumer_count as i64;
            messages += info.state.messages;
            bytes += info.state.bytes;
        }

        Ok(GetStatisticsResponse {
            streams,
            consumers,
            messages,
            bytes,
        })
    }

    async fn do_get_stream_stats(&self, req: GetStreamStatsRequest) -> Result<StreamStats> {
        let mut stream = self.get_stream(&req.user_id, &req.stream).await?;
        let info = stream
            .info()
            .await
            .map_err(|err| backend::classify("get_stream_stats", err))?;
        Ok(StreamStats {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count as i32,
        })
    }
}

#[tonic::async_trait]
impl Broker for BrokerService {
    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("publish", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        let result = self.do_publish(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish_batch(
        &self,
        request: Request<PublishBatchRequest>,
    ) -> std::result::Result<Response<PublishBatchResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("publish_batch", &req.user_id, &req.organization_id)?;
        scope.annotate("entries", req.entries.len().to_string());
        let result = self.do_publish_batch(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    type SubscribeStream =
        Pin<Box<dyn Stream<Item = std::result::Result<Message, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("subscribe", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        let result = self
            .subscription_stream(req.user_id.clone(), req.subject, None)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    type QueueSubscribeStream =
        Pin<Box<dyn Stream<Item = std::result::Result<Message, Status>> + Send>>;

    async fn queue_subscribe(
        &self,
        request: Request<QueueSubscribeRequest>,
    ) -> std::result::Result<Response<Self::QueueSubscribeStream>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("queue_subscribe", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        scope.annotate("queue_group", req.queue_group.as_str());
        let result = self
            .subscription_stream(req.user_id.clone(), req.subject, Some(req.queue_group))
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn unsubscribe(
        &self,
        request: Request<UnsubscribeRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("unsubscribe", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        // Subscriptions are scoped to their server stream and end when the
        // client cancels it; there is no server-side registry to update.
        let result: Result<Ack> = Ok(Ack {});
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn request(
        &self,
        request: Request<RequestRequest>,
    ) -> std::result::Result<Response<RequestResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("request", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        let result = self.do_request(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_stream(
        &self,
        request: Request<CreateStreamRequest>,
    ) -> std::result::Result<Response<StreamInfo>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_stream", &req.user_id, &req.organization_id)?;
        if let Some(config) = &req.config {
            scope.annotate("stream", config.name.as_str());
        }
        let result = self.do_create_stream(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_stream(
        &self,
        request: Request<DeleteStreamRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_stream", &req.user_id, &req.organization_id)?;
        scope.annotate("stream", req.stream.as_str());
        let result = async {
            required("stream", &req.stream)?;
            self.jetstream
                .delete_stream(tenant::stream(&req.user_id, &req.stream))
                .await
                .map_err(|err| backend::classify("delete_stream", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_stream_info(
        &self,
        request: Request<GetStreamInfoRequest>,
    ) -> std::result::Result<Response<StreamInfo>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_stream_info", &req.user_id, &req.organization_id)?;
        let result = self.do_get_stream_info(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_streams(
        &self,
        request: Request<ListStreamsRequest>,
    ) -> std::result::Result<Response<ListStreamsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_streams", &req.user_id, &req.organization_id)?;
        let result = self.do_list_streams(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn update_stream(
        &self,
        request: Request<UpdateStreamRequest>,
    ) -> std::result::Result<Response<StreamInfo>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("update_stream", &req.user_id, &req.organization_id)?;
        let result = self.do_update_stream(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn purge_stream(
        &self,
        request: Request<PurgeStreamRequest>,
    ) -> std::result::Result<Response<PurgeStreamResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("purge_stream", &req.user_id, &req.organization_id)?;
        scope.annotate("stream", req.stream.as_str());
        let result = self.do_purge_stream(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn create_consumer(
        &self,
        request: Request<CreateConsumerRequest>,
    ) -> std::result::Result<Response<ConsumerInfo>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_consumer", &req.user_id, &req.organization_id)?;
        scope.annotate("stream", req.stream.as_str());
        let result = self.do_create_consumer(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_consumer(
        &self,
        request: Request<DeleteConsumerRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_consumer", &req.user_id, &req.organization_id)?;
        scope.annotate("stream", req.stream.as_str());
        scope.annotate("consumer", req.consumer.as_str());
        let result = async {
            let stream = self.get_stream(&req.user_id, &req.stream).await?;
            required("consumer", &req.consumer)?;
            stream
                .delete_consumer(&req.consumer)
                .await
                .map_err(|err| backend::classify("delete_consumer", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_consumer_info(
        &self,
        request: Request<GetConsumerInfoRequest>,
    ) -> std::result::Result<Response<ConsumerInfo>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_consumer_info", &req.user_id, &req.organization_id)?;
        let result = self.do_get_consumer_info(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_consumers(
        &self,
        request: Request<ListConsumersRequest>,
    ) -> std::result::Result<Response<ListConsumersResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_consumers", &req.user_id, &req.organization_id)?;
        let result = self.do_list_consumers(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn pull_messages(
        &self,
        request: Request<PullMessagesRequest>,
    ) -> std::result::Result<Response<PullMessagesResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("pull_messages", &req.user_id, &req.organization_id)?;
        scope.annotate("stream", req.stream.as_str());
        scope.annotate("consumer", req.consumer.as_str());
        let result = self.do_pull_messages(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn ack_message(
        &self,
        request: Request<AckMessageRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("ack_message", &req.user_id, &req.organization_id)?;
        scope.annotate("sequence", req.sequence.to_string());
        let result = self.do_ack("ack_message", &req.ack_subject, "+ACK").await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn nak_message(
        &self,
        request: Request<NakMessageRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("nak_message", &req.user_id, &req.organization_id)?;
        scope.annotate("sequence", req.sequence.to_string());
        let result = self.do_ack("nak_message", &req.ack_subject, "-NAK").await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish_to_stream(
        &self,
        request: Request<PublishToStreamRequest>,
    ) -> std::result::Result<Response<PublishToStreamResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("publish_to_stream", &req.user_id, &req.organization_id)?;
        scope.annotate("subject", req.subject.as_str());
        let result = self.do_publish_to_stream(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn kv_put(
        &self,
        request: Request<KvPutRequest>,
    ) -> std::result::Result<Response<KvPutResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("kv_put", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("key", &req.key)?;
            let revision = self
                .siblings
                .kv_put(&req.user_id, &req.organization_id, &req.bucket, &req.key, req.value)
                .await?;
            Ok(KvPutResponse { revision })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn kv_get(
        &self,
        request: Request<KvGetRequest>,
    ) -> std::result::Result<Response<KvGetResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self.ctx.begin("kv_get", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("key", &req.key)?;
            let (value, revision) = self
                .siblings
                .kv_get(&req.user_id, &req.organization_id, &req.bucket, &req.key)
                .await?;
            Ok(KvGetResponse { value, revision })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn kv_delete(
        &self,
        request: Request<KvDeleteRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("kv_delete", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("key", &req.key)?;
            self.siblings
                .kv_delete(&req.user_id, &req.organization_id, &req.bucket, &req.key)
                .await?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn kv_keys(
        &self,
        request: Request<KvKeysRequest>,
    ) -> std::result::Result<Response<KvKeysResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("kv_keys", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            let keys = self
                .siblings
                .kv_keys(&req.user_id, &req.organization_id, &req.bucket)
                .await?;
            Ok(KvKeysResponse { keys })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn object_put(
        &self,
        request: Request<ObjectPutRequest>,
    ) -> std::result::Result<Response<ObjectPutResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("object_put", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        scope.annotate("name", req.name.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("name", &req.name)?;
            let (size, etag) = self
                .siblings
                .object_put(&req.user_id, &req.organization_id, &req.bucket, &req.name, req.data)
                .await?;
            Ok(ObjectPutResponse { size, etag })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn object_get(
        &self,
        request: Request<ObjectGetRequest>,
    ) -> std::result::Result<Response<ObjectGetResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("object_get", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        scope.annotate("name", req.name.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("name", &req.name)?;
            let (data, etag) = self
                .siblings
                .object_get(&req.user_id, &req.organization_id, &req.bucket, &req.name)
                .await?;
            Ok(ObjectGetResponse {
                size: data.len() as i64,
                data,
                etag,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn object_delete(
        &self,
        request: Request<ObjectDeleteRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("object_delete", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            required("name", &req.name)?;
            self.siblings
                .object_delete(&req.user_id, &req.organization_id, &req.bucket, &req.name)
                .await?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn object_list(
        &self,
        request: Request<ObjectListRequest>,
    ) -> std::result::Result<Response<ObjectListResponse>, Status> {
        use proto_manifold::broker::object_list_response::Entry;

        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("object_list", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.bucket.as_str());
        let result = async {
            required("bucket", &req.bucket)?;
            let entries = self
                .siblings
                .object_list(&req.user_id, &req.organization_id, &req.bucket)
                .await?;
            Ok(ObjectListResponse {
                entries: entries
                    .into_iter()
                    .map(|(name, size, etag)| Entry { name, size, etag })
                    .collect(),
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_statistics(
        &self,
        request: Request<GetStatisticsRequest>,
    ) -> std::result::Result<Response<GetStatisticsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_statistics", &req.user_id, &req.organization_id)?;
        let result = self.do_get_statistics(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_stream_stats(
        &self,
        request: Request<GetStreamStatsRequest>,
    ) -> std::result::Result<Response<StreamStats>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_stream_stats", &req.user_id, &req.organization_id)?;
        let result = self.do_get_stream_stats(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let state = self.client.connection_state();
        let healthy = matches!(state, async_nats::connection::State::Connected);
        Ok(Response::new(HealthCheckResponse {
            healthy,
            status: state.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_configs_are_tenant_prefixed() {
        let config = StreamConfig {
            name: "orders".to_string(),
            subjects: vec!["orders.>".to_string(), "a.*.b".to_string()],
            storage: "file".to_string(),
            max_msgs: 0,
            max_bytes: 0,
            max_age_seconds: 0,
            max_msg_size: 0,
            replicas: 0,
            discard_policy: String::new(),
        };
        let built = build_stream_config("alice", &config).unwrap();
        assert_eq!(built.name, "user-alice-orders");
        // Only the first segment grows the tenant prefix; wildcards stay
        // intact.
        assert_eq!(built.subjects, vec!["user.alice.orders.>", "user.alice.a.*.b"]);
        assert_eq!(built.num_replicas, 1);
        assert_eq!(built.max_messages, -1);
    }

    #[test]
    fn stream_config_requires_name_and_subjects() {
        let mut config = StreamConfig {
            name: String::new(),
            subjects: vec!["s".to_string()],
            ..Default::default()
        };
        assert!(build_stream_config("alice", &config).is_err());
        config.name = "orders".to_string();
        config.subjects.clear();
        assert!(build_stream_config("alice", &config).is_err());
    }

    #[test]
    fn delivered_subjects_are_stripped() {
        let message = async_nats::Message {
            subject: "user.alice.orders.created".into(),
            reply: None,
            payload: bytes::Bytes::from_static(b"{\"id\":1}"),
            headers: None,
            status: None,
            description: None,
            length: 8,
        };
        let out = core_to_proto("alice", message);
        assert_eq!(out.subject, "orders.created");
        assert_eq!(out.data, b"{\"id\":1}");
        assert_eq!(out.sequence, 0);
    }
}
