//! The cache gRPC service.
//!
//! Keys, channels, and scan patterns are rewritten as
//! `{org}:{user}:{logical}` before reaching the backend; listings and
//! deliveries strip the prefix again.

use std::pin::Pin;

use futures::Stream;
use futures::StreamExt;
use manifold_core::{tenant, AdapterContext, Error, Result};
use proto_manifold::cache::cache_server::Cache;
use proto_manifold::cache::{
    ChannelMessage, CounterResponse, DecrementRequest, DeleteRequest, DeleteResponse,
    ExistsRequest, ExistsResponse, ExpireRequest, ExpireResponse, GetRequest, GetResponse,
    HashDeleteRequest, HashDeleteResponse, HashGetAllRequest, HashGetAllResponse, HashGetRequest,
    HashGetResponse, HashSetRequest, HashSetResponse, IncrementRequest, ListKeysRequest,
    ListKeysResponse, ListLenRequest, ListLenResponse, ListPopRequest, ListPopResponse,
    ListPushRequest, ListPushResponse, ListRangeRequest, ListRangeResponse, PublishRequest,
    PublishResponse, ScoredMember, SetAddRequest, SetAddResponse, SetIsMemberRequest,
    SetIsMemberResponse, SetMembersRequest, SetMembersResponse, SetRemoveRequest,
    SetRemoveResponse, SetRequest, SortedSetAddRequest, SortedSetAddResponse,
    SortedSetRangeRequest, SortedSetRangeResponse, SortedSetRemoveRequest,
    SortedSetRemoveResponse, SubscribeRequest, TtlRequest, TtlResponse,
};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use tonic::{Request, Response, Status};

use crate::backend;

/// Default and hard cap for pattern scans.
const DEFAULT_SCAN_LIMIT: i64 = 100;
const MAX_SCAN_LIMIT: i64 = 1000;
/// Page size handed to the backend's cursor scan.
const SCAN_COUNT: usize = 200;

pub struct CacheService {
    ctx: AdapterContext,
    pool: deadpool_redis::Pool,
    client: redis::Client,
}

impl CacheService {
    pub fn new(ctx: AdapterContext, pool: deadpool_redis::Pool, client: redis::Client) -> Self {
        Self { ctx, pool, client }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|err| backend::classify_pool("acquire", err))
    }
}

fn required_key(key: &str) -> Result<()> {
    if key.is_empty() {
        Err(Error::InvalidArgument("key is required".to_string()))
    } else {
        Ok(())
    }
}

fn effective_scan_limit(requested: i64) -> i64 {
    if requested <= 0 {
        DEFAULT_SCAN_LIMIT
    } else {
        requested.min(MAX_SCAN_LIMIT)
    }
}

impl CacheService {
    async fn do_get(&self, req: GetRequest) -> Result<GetResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("get", err))?;
        match value {
            Some(value) => Ok(GetResponse { value }),
            None => Err(Error::NotFound(format!("key '{}' not found", req.key))),
        }
    }

    async fn do_set(&self, req: SetRequest) -> Result<Ack> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(&physical).arg(req.value.as_slice());
        if req.ttl_seconds > 0 {
            cmd.arg("EX").arg(req.ttl_seconds);
        }
        cmd.query_async::<()>(&mut conn)
            .await
            .map_err(|err| backend::classify("set", err))?;
        Ok(Ack {})
    }

    async fn do_delete(&self, req: DeleteRequest) -> Result<DeleteResponse> {
        if req.keys.is_empty() {
            return Err(Error::InvalidArgument("keys is required".to_string()));
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("DEL");
        for key in &req.keys {
            cmd.arg(tenant::cache_key(&req.organization_id, &req.user_id, key));
        }
        let deleted: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("delete", err))?;
        Ok(DeleteResponse { deleted })
    }

    async fn do_exists(&self, req: ExistsRequest) -> Result<ExistsResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("EXISTS")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("exists", err))?;
        Ok(ExistsResponse { exists })
    }

    async fn do_expire(&self, req: ExpireRequest) -> Result<ExpireResponse> {
        required_key(&req.key)?;
        if req.ttl_seconds <= 0 {
            return Err(Error::InvalidArgument(
                "ttl_seconds must be positive".to_string(),
            ));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let applied: bool = redis::cmd("EXPIRE")
            .arg(&physical)
            .arg(req.ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("expire", err))?;
        Ok(ExpireResponse { applied })
    }

    async fn do_ttl(&self, req: TtlRequest) -> Result<TtlResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let ttl_seconds: i64 = redis::cmd("TTL")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("ttl", err))?;
        Ok(TtlResponse { ttl_seconds })
    }

    async fn counter(&self, op: &'static str, user: &str, org: &str, key: &str, delta: i64) -> Result<CounterResponse> {
        required_key(key)?;
        let physical = tenant::cache_key(org, user, key);
        let mut conn = self.conn().await?;
        let value: i64 = redis::cmd(if op == "increment" { "INCRBY" } else { "DECRBY" })
            .arg(&physical)
            .arg(if delta == 0 { 1 } else { delta })
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify(op, err))?;
        Ok(CounterResponse { value })
    }

    async fn do_hash_set(&self, req: HashSetRequest) -> Result<HashSetResponse> {
        required_key(&req.key)?;
        if req.fields.is_empty() {
            return Err(Error::InvalidArgument("fields is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(&physical);
        for (field, value) in &req.fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let added: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("hash_set", err))?;
        Ok(HashSetResponse { added })
    }

    async fn do_hash_get(&self, req: HashGetRequest) -> Result<HashGetResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(&physical)
            .arg(&req.field)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("hash_get", err))?;
        match value {
            Some(value) => Ok(HashGetResponse { value }),
            None => Err(Error::NotFound(format!(
                "field '{}' not found in '{}'",
                req.field, req.key
            ))),
        }
    }

    async fn do_hash_get_all(&self, req: HashGetAllRequest) -> Result<HashGetAllResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let fields: std::collections::HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("hash_get_all", err))?;
        Ok(HashGetAllResponse { fields })
    }

    async fn do_hash_delete(&self, req: HashDeleteRequest) -> Result<HashDeleteResponse> {
        required_key(&req.key)?;
        if req.fields.is_empty() {
            return Err(Error::InvalidArgument("fields is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(&physical);
        for field in &req.fields {
            cmd.arg(field);
        }
        let deleted: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("hash_delete", err))?;
        Ok(HashDeleteResponse { deleted })
    }

    async fn do_list_push(&self, req: ListPushRequest) -> Result<ListPushResponse> {
        required_key(&req.key)?;
        if req.values.is_empty() {
            return Err(Error::InvalidArgument("values is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd(if req.prepend { "LPUSH" } else { "RPUSH" });
        cmd.arg(&physical);
        for value in &req.values {
            cmd.arg(value.as_slice());
        }
        let length: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("list_push", err))?;
        Ok(ListPushResponse { length })
    }

    async fn do_list_pop(&self, req: ListPopRequest) -> Result<ListPopResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = redis::cmd(if req.from_front { "LPOP" } else { "RPOP" })
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("list_pop", err))?;
        match value {
            Some(value) => Ok(ListPopResponse { value }),
            None => Err(Error::NotFound(format!("list '{}' is empty", req.key))),
        }
    }

    async fn do_list_range(&self, req: ListRangeRequest) -> Result<ListRangeResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let values: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(&physical)
            .arg(req.start)
            .arg(req.stop)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("list_range", err))?;
        Ok(ListRangeResponse { values })
    }

    async fn do_list_len(&self, req: ListLenRequest) -> Result<ListLenResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let length: i64 = redis::cmd("LLEN")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("list_len", err))?;
        Ok(ListLenResponse { length })
    }

    async fn do_set_add(&self, req: SetAddRequest) -> Result<SetAddResponse> {
        required_key(&req.key)?;
        if req.members.is_empty() {
            return Err(Error::InvalidArgument("members is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SADD");
        cmd.arg(&physical);
        for member in &req.members {
            cmd.arg(member.as_slice());
        }
        let added: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("set_add", err))?;
        Ok(SetAddResponse { added })
    }

    async fn do_set_remove(&self, req: SetRemoveRequest) -> Result<SetRemoveResponse> {
        required_key(&req.key)?;
        if req.members.is_empty() {
            return Err(Error::InvalidArgument("members is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SREM");
        cmd.arg(&physical);
        for member in &req.members {
            cmd.arg(member.as_slice());
        }
        let removed: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("set_remove", err))?;
        Ok(SetRemoveResponse { removed })
    }

    async fn do_set_members(&self, req: SetMembersRequest) -> Result<SetMembersResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let members: Vec<Vec<u8>> = redis::cmd("SMEMBERS")
            .arg(&physical)
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("set_members", err))?;
        Ok(SetMembersResponse { members })
    }

    async fn do_set_is_member(&self, req: SetIsMemberRequest) -> Result<SetIsMemberResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let is_member: bool = redis::cmd("SISMEMBER")
            .arg(&physical)
            .arg(req.member.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("set_is_member", err))?;
        Ok(SetIsMemberResponse { is_member })
    }

    async fn do_sorted_set_add(&self, req: SortedSetAddRequest) -> Result<SortedSetAddResponse> {
        required_key(&req.key)?;
        if req.members.is_empty() {
            return Err(Error::InvalidArgument("members is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(&physical);
        for member in &req.members {
            cmd.arg(member.score).arg(member.member.as_slice());
        }
        let added: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("sorted_set_add", err))?;
        Ok(SortedSetAddResponse { added })
    }

    async fn do_sorted_set_range(
        &self,
        req: SortedSetRangeRequest,
    ) -> Result<SortedSetRangeResponse> {
        required_key(&req.key)?;
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(&physical).arg(req.start).arg(req.stop);
        if req.reverse {
            cmd.arg("REV");
        }
        cmd.arg("WITHSCORES");
        let members: Vec<(Vec<u8>, f64)> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("sorted_set_range", err))?;
        Ok(SortedSetRangeResponse {
            members: members
                .into_iter()
                .map(|(member, score)| ScoredMember { score, member })
                .collect(),
        })
    }

    async fn do_sorted_set_remove(
        &self,
        req: SortedSetRemoveRequest,
    ) -> Result<SortedSetRemoveResponse> {
        required_key(&req.key)?;
        if req.members.is_empty() {
            return Err(Error::InvalidArgument("members is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.key);
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(&physical);
        for member in &req.members {
            cmd.arg(member.as_slice());
        }
        let removed: i64 = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("sorted_set_remove", err))?;
        Ok(SortedSetRemoveResponse { removed })
    }

    /// Cursor scan with a server-side cap; never an unbounded `KEYS`.
    async fn do_list_keys(&self, req: ListKeysRequest) -> Result<ListKeysResponse> {
        let pattern = if req.pattern.is_empty() { "*" } else { &req.pattern };
        let physical_pattern =
            tenant::cache_key(&req.organization_id, &req.user_id, pattern);
        let limit = effective_scan_limit(req.limit) as usize;

        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut truncated = false;
        let mut cursor: u64 = 0;
        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&physical_pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(|err| backend::classify("list_keys", err))?;

            for key in page {
                if keys.len() >= limit {
                    truncated = true;
                    break;
                }
                if let Some(logical) =
                    tenant::strip_cache_key(&req.organization_id, &req.user_id, &key)
                {
                    keys.push(logical);
                }
            }
            if truncated || next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(ListKeysResponse { keys, truncated })
    }

    async fn do_publish(&self, req: PublishRequest) -> Result<PublishResponse> {
        if req.channel.is_empty() {
            return Err(Error::InvalidArgument("channel is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.channel);
        let mut conn = self.conn().await?;
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&physical)
            .arg(req.payload.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|err| backend::classify("publish", err))?;
        Ok(PublishResponse { receivers })
    }

    async fn do_subscribe(
        &self,
        req: SubscribeRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = std::result::Result<ChannelMessage, Status>> + Send>>>
    {
        if req.channel.is_empty() {
            return Err(Error::InvalidArgument("channel is required".to_string()));
        }
        let physical = tenant::cache_key(&req.organization_id, &req.user_id, &req.channel);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|err| backend::classify("subscribe", err))?;
        pubsub
            .subscribe(&physical)
            .await
            .map_err(|err| backend::classify("subscribe", err))?;

        let organization_id = req.organization_id.clone();
        let user_id = req.user_id.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(message) = messages.next().await {
                let channel = tenant::strip_cache_key(
                    &organization_id,
                    &user_id,
                    message.get_channel_name(),
                )
                .unwrap_or_else(|| message.get_channel_name().to_string());
                let out = ChannelMessage {
                    channel,
                    payload: message.get_payload_bytes().to_vec(),
                };
                // The subscription ends when the client goes away.
                if tx.send(Ok(out)).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

#[tonic::async_trait]
impl Cache for CacheService {
    async fn get(
        &self,
        request: Request<GetRequest>,
    ) -> std::result::Result<Response<GetResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("get", &req.user_id, &req.organization_id)?;
        let result = self.do_get(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set(
        &self,
        request: Request<SetRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("set", &req.user_id, &req.organization_id)?;
        let result = self.do_set(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> std::result::Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("delete", &req.user_id, &req.organization_id)?;
        let result = self.do_delete(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn exists(
        &self,
        request: Request<ExistsRequest>,
    ) -> std::result::Result<Response<ExistsResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("exists", &req.user_id, &req.organization_id)?;
        let result = self.do_exists(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn expire(
        &self,
        request: Request<ExpireRequest>,
    ) -> std::result::Result<Response<ExpireResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("expire", &req.user_id, &req.organization_id)?;
        let result = self.do_expire(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn ttl(
        &self,
        request: Request<TtlRequest>,
    ) -> std::result::Result<Response<TtlResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin("ttl", &req.user_id, &req.organization_id)?;
        let result = self.do_ttl(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn increment(
        &self,
        request: Request<IncrementRequest>,
    ) -> std::result::Result<Response<CounterResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("increment", &req.user_id, &req.organization_id)?;
        let result = self
            .counter("increment", &req.user_id, &req.organization_id, &req.key, req.delta)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn decrement(
        &self,
        request: Request<DecrementRequest>,
    ) -> std::result::Result<Response<CounterResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("decrement", &req.user_id, &req.organization_id)?;
        let result = self
            .counter("decrement", &req.user_id, &req.organization_id, &req.key, req.delta)
            .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn hash_set(
        &self,
        request: Request<HashSetRequest>,
    ) -> std::result::Result<Response<HashSetResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("hash_set", &req.user_id, &req.organization_id)?;
        let result = self.do_hash_set(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn hash_get(
        &self,
        request: Request<HashGetRequest>,
    ) -> std::result::Result<Response<HashGetResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("hash_get", &req.user_id, &req.organization_id)?;
        let result = self.do_hash_get(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn hash_get_all(
        &self,
        request: Request<HashGetAllRequest>,
    ) -> std::result::Result<Response<HashGetAllResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("hash_get_all", &req.user_id, &req.organization_id)?;
        let result = self.do_hash_get_all(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn hash_delete(
        &self,
        request: Request<HashDeleteRequest>,
    ) -> std::result::Result<Response<HashDeleteResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("hash_delete", &req.user_id, &req.organization_id)?;
        let result = self.do_hash_delete(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_push(
        &self,
        request: Request<ListPushRequest>,
    ) -> std::result::Result<Response<ListPushResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_push", &req.user_id, &req.organization_id)?;
        let result = self.do_list_push(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_pop(
        &self,
        request: Request<ListPopRequest>,
    ) -> std::result::Result<Response<ListPopResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_pop", &req.user_id, &req.organization_id)?;
        let result = self.do_list_pop(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_range(
        &self,
        request: Request<ListRangeRequest>,
    ) -> std::result::Result<Response<ListRangeResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_range", &req.user_id, &req.organization_id)?;
        let result = self.do_list_range(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_len(
        &self,
        request: Request<ListLenRequest>,
    ) -> std::result::Result<Response<ListLenResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_len", &req.user_id, &req.organization_id)?;
        let result = self.do_list_len(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_add(
        &self,
        request: Request<SetAddRequest>,
    ) -> std::result::Result<Response<SetAddResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_add", &req.user_id, &req.organization_id)?;
        let result = self.do_set_add(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_remove(
        &self,
        request: Request<SetRemoveRequest>,
    ) -> std::result::Result<Response<SetRemoveResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_remove", &req.user_id, &req.organization_id)?;
        let result = self.do_set_remove(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_members(
        &self,
        request: Request<SetMembersRequest>,
    ) -> std::result::Result<Response<SetMembersResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_members", &req.user_id, &req.organization_id)?;
        let result = self.do_set_members(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_is_member(
        &self,
        request: Request<SetIsMemberRequest>,
    ) -> std::result::Result<Response<SetIsMemberResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_is_member", &req.user_id, &req.organization_id)?;
        let result = self.do_set_is_member(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn sorted_set_add(
        &self,
        request: Request<SortedSetAddRequest>,
    ) -> std::result::Result<Response<SortedSetAddResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("sorted_set_add", &req.user_id, &req.organization_id)?;
        let result = self.do_sorted_set_add(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn sorted_set_range(
        &self,
        request: Request<SortedSetRangeRequest>,
    ) -> std::result::Result<Response<SortedSetRangeResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("sorted_set_range", &req.user_id, &req.organization_id)?;
        let result = self.do_sorted_set_range(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn sorted_set_remove(
        &self,
        request: Request<SortedSetRemoveRequest>,
    ) -> std::result::Result<Response<SortedSetRemoveResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("sorted_set_remove", &req.user_id, &req.organization_id)?;
        let result = self.do_sorted_set_remove(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_keys(
        &self,
        request: Request<ListKeysRequest>,
    ) -> std::result::Result<Response<ListKeysResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_keys", &req.user_id, &req.organization_id)?;
        let result = self.do_list_keys(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn publish(
        &self,
        request: Request<PublishRequest>,
    ) -> std::result::Result<Response<PublishResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("publish", &req.user_id, &req.organization_id)?;
        let result = self.do_publish(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    type SubscribeStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ChannelMessage, Status>> + Send>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> std::result::Result<Response<Self::SubscribeStream>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("subscribe", &req.user_id, &req.organization_id)?;
        scope.annotate("channel", req.channel.as_str());
        let result = self.do_subscribe(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let response = match self.conn().await {
            Ok(mut conn) => match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => HealthCheckResponse {
                    healthy: true,
                    status: "connected".to_string(),
                },
                Err(err) => HealthCheckResponse {
                    healthy: false,
                    status: backend::classify("health_check", err).to_string(),
                },
            },
            Err(err) => HealthCheckResponse {
                healthy: false,
                status: err.to_string(),
            },
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_limit_is_enforced() {
        assert_eq!(effective_scan_limit(0), DEFAULT_SCAN_LIMIT);
        assert_eq!(effective_scan_limit(-1), DEFAULT_SCAN_LIMIT);
        assert_eq!(effective_scan_limit(10), 10);
        assert_eq!(effective_scan_limit(100_000), MAX_SCAN_LIMIT);
    }

    #[test]
    fn empty_keys_are_rejected() {
        assert!(matches!(required_key(""), Err(Error::InvalidArgument(_))));
        assert!(required_key("session:42").is_ok());
    }
}
