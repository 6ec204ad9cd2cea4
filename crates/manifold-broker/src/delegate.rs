//! Outbound gRPC delegation for the broker's key-value and object
//! sub-APIs.
//!
//! The broker deliberately calls its sibling adapters over their own gRPC
//! surfaces rather than embedding a second storage engine: the siblings
//! stay independently deployable and their tenant prefixes compose with
//! the rewrites applied here.

use manifold_core::{Error, Result};
use proto_manifold::cache::cache_client::CacheClient;
use proto_manifold::objectstore::object_store_client::ObjectStoreClient;
use proto_manifold::{cache, objectstore};
use tonic::transport::Channel;

/// Upload frames forwarded to the object-store adapter are bounded to the
/// streaming chunk size.
const OBJECT_CHUNK: usize = 1 << 20;

#[derive(Clone)]
pub struct Siblings {
    cache: CacheClient<Channel>,
    objects: ObjectStoreClient<Channel>,
}

/// Key layout for the KV sub-API inside the cache adapter's namespace.
pub fn kv_value_key(user_id: &str, bucket: &str, key: &str) -> String {
    format!("nats-kv:{user_id}:{bucket}:{key}")
}

pub fn kv_revision_key(user_id: &str, bucket: &str, key: &str) -> String {
    format!("nats-kv:revision:{user_id}:{bucket}:{key}")
}

/// Bucket rewrite for the object sub-API; the object-store adapter applies
/// its own tenant prefix on top.
pub fn object_bucket(user_id: &str, bucket: &str) -> String {
    manifold_core::tenant::obj_bucket(user_id, bucket)
}

fn from_status(context: &str, status: tonic::Status) -> Error {
    let detail = format!("{context}: {}", status.message());
    match status.code() {
        tonic::Code::NotFound => Error::NotFound(detail),
        tonic::Code::AlreadyExists => Error::AlreadyExists(detail),
        tonic::Code::InvalidArgument => Error::InvalidArgument(detail),
        tonic::Code::PermissionDenied => Error::PermissionDenied(detail),
        tonic::Code::FailedPrecondition => Error::FailedPrecondition(detail),
        tonic::Code::DeadlineExceeded => Error::DeadlineExceeded(detail),
        tonic::Code::ResourceExhausted => Error::ResourceExhausted(detail),
        tonic::Code::Unavailable => Error::Unavailable(detail),
        _ => Error::Internal(detail),
    }
}

impl Siblings {
    pub fn connect(cache_url: &str, object_url: &str) -> anyhow::Result<Self> {
        // Lazy channels: the siblings may come up after this adapter.
        let cache_channel = tonic::transport::Endpoint::from_shared(cache_url.to_string())?
            .connect_lazy();
        let object_channel = tonic::transport::Endpoint::from_shared(object_url.to_string())?
            .connect_lazy();
        Ok(Self {
            cache: CacheClient::new(cache_channel),
            objects: ObjectStoreClient::new(object_channel),
        })
    }

    pub async fn kv_put(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<u64> {
        let mut cache = self.cache.clone();
        cache
            .set(cache::SetRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                key: kv_value_key(user_id, bucket, key),
                value,
                ttl_seconds: 0,
            })
            .await
            .map_err(|status| from_status("kv_put", status))?;

        let revision = cache
            .increment(cache::IncrementRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                key: kv_revision_key(user_id, bucket, key),
                delta: 1,
            })
            .await
            .map_err(|status| from_status("kv_put", status))?
            .into_inner()
            .value;

        Ok(revision.max(0) as u64)
    }

    pub async fn kv_get(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<(Vec<u8>, u64)> {
        let mut cache = self.cache.clone();
        let value = cache
            .get(cache::GetRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                key: kv_value_key(user_id, bucket, key),
            })
            .await
            .map_err(|status| from_status("kv_get", status))?
            .into_inner()
            .value;

        let revision = match cache
            .get(cache::GetRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                key: kv_revision_key(user_id, bucket, key),
            })
            .await
        {
            Ok(response) => String::from_utf8_lossy(&response.into_inner().value)
                .parse::<u64>()
                .unwrap_or(1),
            Err(status) if status.code() == tonic::Code::NotFound => 1,
            Err(status) => return Err(from_status("kv_get", status)),
        };

        Ok((value, revision))
    }

    pub async fn kv_delete(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        key: &str,
    ) -> Result<()> {
        let mut cache = self.cache.clone();
        cache
            .delete(cache::DeleteRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                keys: vec![
                    kv_value_key(user_id, bucket, key),
                    kv_revision_key(user_id, bucket, key),
                ],
            })
            .await
            .map_err(|status| from_status("kv_delete", status))?;
        Ok(())
    }

    pub async fn kv_keys(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
    ) -> Result<Vec<String>> {
        let prefix = format!("nats-kv:{user_id}:{bucket}:");
        let mut cache = self.cache.clone();
        let response = cache
            .list_keys(cache::ListKeysRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                pattern: format!("{prefix}*"),
                limit: 1000,
            })
            .await
            .map_err(|status| from_status("kv_keys", status))?
            .into_inner();

        Ok(response
            .keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(str::to_owned)
            .collect())
    }

    pub async fn object_put(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        name: &str,
        data: Vec<u8>,
    ) -> Result<(i64, String)> {
        let mut objects = self.objects.clone();
        let logical_bucket = object_bucket(user_id, bucket);

        // The sub-API bucket is created on first use.
        let create = objects
            .create_bucket(objectstore::CreateBucketRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                logical_bucket: logical_bucket.clone(),
                region: String::new(),
                tags: Default::default(),
            })
            .await;
        if let Err(status) = create {
            if status.code() != tonic::Code::AlreadyExists {
                return Err(from_status("object_put", status));
            }
        }

        let metadata = objectstore::PutObjectMetadata {
            user_id: user_id.to_string(),
            organization_id: organization_id.to_string(),
            logical_bucket,
            object_key: name.to_string(),
            content_type: String::new(),
            content_length: data.len() as i64,
            user_metadata: Default::default(),
        };
        let mut frames = vec![objectstore::PutObjectRequest {
            frame: Some(objectstore::put_object_request::Frame::Metadata(metadata)),
        }];
        for chunk in data.chunks(OBJECT_CHUNK) {
            frames.push(objectstore::PutObjectRequest {
                frame: Some(objectstore::put_object_request::Frame::Chunk(
                    chunk.to_vec(),
                )),
            });
        }

        let response = objects
            .put_object(futures::stream::iter(frames))
            .await
            .map_err(|status| from_status("object_put", status))?
            .into_inner();

        Ok((response.size, response.etag))
    }

    pub async fn object_get(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        name: &str,
    ) -> Result<(Vec<u8>, String)> {
        let mut objects = self.objects.clone();
        let mut stream = objects
            .get_object(objectstore::GetObjectRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                logical_bucket: object_bucket(user_id, bucket),
                object_key: name.to_string(),
                version_id: String::new(),
                offset: 0,
                length: 0,
            })
            .await
            .map_err(|status| from_status("object_get", status))?
            .into_inner();

        let mut data = Vec::new();
        let mut etag = String::new();
        while let Some(frame) = stream
            .message()
            .await
            .map_err(|status| from_status("object_get", status))?
        {
            match frame.frame {
                Some(objectstore::get_object_response::Frame::Metadata(meta)) => {
                    etag = meta.etag;
                }
                Some(objectstore::get_object_response::Frame::Chunk(chunk)) => {
                    data.extend_from_slice(&chunk);
                }
                None => (),
            }
        }
        Ok((data, etag))
    }

    pub async fn object_delete(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
        name: &str,
    ) -> Result<()> {
        let mut objects = self.objects.clone();
        objects
            .delete_object(objectstore::DeleteObjectRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                logical_bucket: object_bucket(user_id, bucket),
                object_key: name.to_string(),
                version_id: String::new(),
            })
            .await
            .map_err(|status| from_status("object_delete", status))?;
        Ok(())
    }

    pub async fn object_list(
        &self,
        user_id: &str,
        organization_id: &str,
        bucket: &str,
    ) -> Result<Vec<(String, i64, String)>> {
        let mut objects = self.objects.clone();
        let response = objects
            .list_objects(objectstore::ListObjectsRequest {
                user_id: user_id.to_string(),
                organization_id: organization_id.to_string(),
                logical_bucket: object_bucket(user_id, bucket),
                prefix: String::new(),
                max_keys: 0,
                recursive: true,
            })
            .await
            .map_err(|status| from_status("object_list", status))?
            .into_inner();

        Ok(response
            .objects
            .into_iter()
            .filter(|o| !o.is_prefix)
            .map(|o| (o.object_key, o.size, o.etag))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_keys_compose_broker_and_tenant_layers() {
        assert_eq!(
            kv_value_key("alice", "config", "retries"),
            "nats-kv:alice:config:retries"
        );
        assert_eq!(
            kv_revision_key("alice", "config", "retries"),
            "nats-kv:revision:alice:config:retries"
        );
        // Disjoint across users before the cache adapter adds its own
        // prefix.
        assert_ne!(
            kv_value_key("alice", "b", "k"),
            kv_value_key("bob", "b", "k")
        );
    }

    #[test]
    fn object_buckets_are_rewritten() {
        assert_eq!(object_bucket("alice", "blobs"), "obj-user-alice-blobs");
    }

    #[test]
    fn sibling_statuses_map_back_into_the_taxonomy() {
        let err = from_status("kv_get", tonic::Status::not_found("missing"));
        assert!(matches!(err, Error::NotFound(_)));
        let err = from_status("kv_put", tonic::Status::unavailable("down"));
        assert!(matches!(err, Error::Unavailable(_)));
    }
}
