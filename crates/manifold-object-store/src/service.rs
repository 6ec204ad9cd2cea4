//! The object-store gRPC service.
//!
//! Every RPC validates the caller, derives the physical bucket from the
//! tenant identity, performs the backend call, maps errors through the
//! taxonomy, and emits one audit record.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, BucketLocationConstraint, BucketVersioningStatus,
    CreateBucketConfiguration, Delete, MetadataDirective, ObjectIdentifier, Tag, Tagging,
    VersioningConfiguration,
};
use bytes::Bytes;
use futures::Stream;
use manifold_core::{tenant, AdapterContext, Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use proto_manifold::common::{Ack, HealthCheckRequest, HealthCheckResponse};
use proto_manifold::objectstore::object_store_server::ObjectStore;
use proto_manifold::objectstore::{
    get_object_response, put_object_request, upload_part_request, AbortMultipartUploadRequest,
    BucketInfo, CompleteMultipartUploadRequest, CompleteMultipartUploadResponse,
    CopyObjectRequest, CopyObjectResponse, CreateBucketRequest, DeleteBucketLifecycleRequest,
    DeleteBucketRequest, DeleteBucketResponse, DeleteBucketTagsRequest, DeleteObjectRequest,
    DeleteObjectTagsRequest, DeleteObjectsRequest, DeleteObjectsResponse, GetBucketInfoRequest,
    GetBucketLifecycleRequest, GetBucketLifecycleResponse, GetBucketPolicyRequest,
    GetBucketPolicyResponse, GetBucketTagsRequest, GetBucketTagsResponse,
    GetBucketVersioningRequest, GetBucketVersioningResponse, GetObjectRequest,
    GetObjectResponse, GetObjectTagsRequest, GetObjectTagsResponse, GetPresignedPutUrlRequest,
    GetPresignedUrlRequest, InitiateMultipartUploadRequest, InitiateMultipartUploadResponse,
    ListBucketsRequest, ListBucketsResponse, ListObjectsRequest, ListObjectsResponse,
    ObjectItem, ObjectMetadata, PresignedUrlResponse, PutObjectRequest, PutObjectResponse,
    SetBucketLifecycleRequest, SetBucketPolicyRequest, SetBucketTagsRequest,
    SetBucketVersioningRequest, SetObjectTagsRequest, StatObjectRequest, UploadPartRequest,
    UploadPartResponse,
};
use tonic::{Request, Response, Status, Streaming};

use crate::backend;
use crate::lifecycle;
use crate::upload::{trim_etag, StreamingUpload};

/// Outbound download frames are at most this large.
const DOWNLOAD_CHUNK: usize = 1 << 20;
/// Backend-safe listing cap.
const MAX_LIST_KEYS: i32 = 1000;
/// Hard bound on a single buffered multipart part.
const MAX_PART_BYTES: usize = 64 * (1 << 20);
/// Presigned URLs cannot outlive the signature algorithm's limit.
const MAX_PRESIGN_SECONDS: u64 = 7 * 24 * 3600;
const DEFAULT_GET_EXPIRY_SECONDS: u64 = MAX_PRESIGN_SECONDS;
const DEFAULT_PUT_EXPIRY_SECONDS: u64 = 3600;

/// `x-amz-copy-source` escaping: keep the path separator and unreserved
/// characters.
const COPY_SOURCE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub struct ObjectStoreService {
    ctx: AdapterContext,
    s3: aws_sdk_s3::Client,
    region: String,
    max_upload_bytes: u64,
}

impl ObjectStoreService {
    pub fn new(
        ctx: AdapterContext,
        s3: aws_sdk_s3::Client,
        region: String,
        max_upload_bytes: u64,
    ) -> Self {
        Self {
            ctx,
            s3,
            region,
            max_upload_bytes,
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

fn effective_max_keys(requested: i32) -> i32 {
    if requested <= 0 {
        MAX_LIST_KEYS
    } else {
        requested.min(MAX_LIST_KEYS)
    }
}

fn clamp_expiry(requested_seconds: i64, default_seconds: u64) -> Duration {
    let seconds = if requested_seconds <= 0 {
        default_seconds
    } else {
        (requested_seconds as u64).min(MAX_PRESIGN_SECONDS)
    };
    Duration::from_secs(seconds.max(1))
}

fn byte_range(offset: i64, length: i64) -> Option<String> {
    if offset <= 0 && length <= 0 {
        None
    } else if length > 0 {
        Some(format!("bytes={}-{}", offset.max(0), offset.max(0) + length - 1))
    } else {
        Some(format!("bytes={}-", offset.max(0)))
    }
}

fn datetime_millis(dt: Option<&aws_sdk_s3::primitives::DateTime>) -> i64 {
    dt.and_then(|d| d.to_millis().ok()).unwrap_or_default()
}

fn to_tag_set(tags: &HashMap<String, String>) -> Result<Vec<Tag>> {
    tags.iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|err| Error::InvalidArgument(format!("invalid tag: {err}")))
        })
        .collect()
}

fn from_tag_set(tags: &[Tag]) -> HashMap<String, String> {
    tags.iter()
        .map(|t| (t.key().to_string(), t.value().to_string()))
        .collect()
}

impl ObjectStoreService {
    async fn do_create_bucket(&self, req: CreateBucketRequest) -> Result<BucketInfo> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;

        let mut create = self.s3.create_bucket().bucket(&physical);
        if !self.region.is_empty() && self.region != "us-east-1" {
            create = create.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        create
            .send()
            .await
            .map_err(|err| backend::classify("create_bucket", err))?;

        if !req.tags.is_empty() {
            let tagging = Tagging::builder()
                .set_tag_set(Some(to_tag_set(&req.tags)?))
                .build()
                .map_err(|err| Error::InvalidArgument(format!("invalid tags: {err}")))?;
            self.s3
                .put_bucket_tagging()
                .bucket(&physical)
                .tagging(tagging)
                .send()
                .await
                .map_err(|err| backend::classify("create_bucket", err))?;
        }

        let logical = tenant::strip_bucket(&req.user_id, &physical)
            .unwrap_or_else(|| req.logical_bucket.clone());
        Ok(BucketInfo {
            logical_name: logical,
            owner_user_id: req.user_id,
            organization_id: req.organization_id,
            region: self.region.clone(),
            creation_time: chrono::Utc::now().timestamp_millis(),
            size_bytes: 0,
            object_count: 0,
            tags: req.tags,
            versioning_enabled: false,
            lifecycle_json: String::new(),
        })
    }

    async fn do_list_buckets(&self, req: ListBucketsRequest) -> Result<ListBucketsResponse> {
        let output = self
            .s3
            .list_buckets()
            .send()
            .await
            .map_err(|err| backend::classify("list_buckets", err))?;

        let mut buckets = Vec::new();
        for bucket in output.buckets() {
            let Some(name) = bucket.name() else { continue };
            let Some(logical) = tenant::strip_bucket(&req.user_id, name) else {
                continue;
            };
            if !req.prefix.is_empty() && !logical.starts_with(&req.prefix) {
                continue;
            }
            buckets.push(BucketInfo {
                logical_name: logical,
                owner_user_id: req.user_id.clone(),
                organization_id: req.organization_id.clone(),
                region: self.region.clone(),
                creation_time: datetime_millis(bucket.creation_date()),
                size_bytes: 0,
                object_count: 0,
                tags: HashMap::new(),
                versioning_enabled: false,
                lifecycle_json: String::new(),
            });
        }
        Ok(ListBucketsResponse { buckets })
    }

    async fn purge_bucket(&self, physical: &str) -> Result<i64> {
        let mut deleted: i64 = 0;
        loop {
            let listing = self
                .s3
                .list_objects_v2()
                .bucket(physical)
                .max_keys(MAX_LIST_KEYS)
                .send()
                .await
                .map_err(|err| backend::classify("delete_bucket", err))?;

            let identifiers: Vec<ObjectIdentifier> = listing
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|err| Error::Internal(format!("delete_bucket: {err}")))
                })
                .collect::<Result<_>>()?;
            if identifiers.is_empty() {
                return Ok(deleted);
            }
            let count = identifiers.len() as i64;

            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|err| Error::Internal(format!("delete_bucket: {err}")))?;
            let output = self
                .s3
                .delete_objects()
                .bucket(physical)
                .delete(delete)
                .send()
                .await
                .map_err(|err| backend::classify("delete_bucket", err))?;

            if let Some(first) = output.errors().first() {
                return Err(Error::Internal(format!(
                    "delete_bucket: failed to delete '{}': {}",
                    first.key().unwrap_or_default(),
                    first.message().unwrap_or_default(),
                )));
            }
            deleted += count;
        }
    }

    async fn do_delete_bucket(&self, req: DeleteBucketRequest) -> Result<DeleteBucketResponse> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;

        let deleted_object_count = if req.force {
            self.purge_bucket(&physical).await?
        } else {
            0
        };

        self.s3
            .delete_bucket()
            .bucket(&physical)
            .send()
            .await
            .map_err(|err| backend::classify("delete_bucket", err))?;

        Ok(DeleteBucketResponse {
            deleted_object_count,
        })
    }

    async fn do_get_bucket_info(&self, req: GetBucketInfoRequest) -> Result<BucketInfo> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;

        self.s3
            .head_bucket()
            .bucket(&physical)
            .send()
            .await
            .map_err(|err| backend::classify("get_bucket_info", err))?;

        let (size_bytes, object_count) = self.bucket_usage(&physical).await?;
        let tags = self.bucket_tags(&physical).await?;
        let versioning_enabled = self.bucket_versioning(&physical).await?;
        let lifecycle_json = self.bucket_lifecycle(&physical).await?.unwrap_or_default();

        Ok(BucketInfo {
            logical_name: tenant::strip_bucket(&req.user_id, &physical)
                .unwrap_or_else(|| req.logical_bucket.clone()),
            owner_user_id: req.user_id,
            organization_id: req.organization_id,
            region: self.region.clone(),
            creation_time: 0,
            size_bytes,
            object_count,
            tags,
            versioning_enabled,
            lifecycle_json,
        })
    }

    async fn bucket_usage(&self, physical: &str) -> Result<(i64, i64)> {
        let mut bytes: i64 = 0;
        let mut count: i64 = 0;
        let mut token: Option<String> = None;
        loop {
            let mut list = self
                .s3
                .list_objects_v2()
                .bucket(physical)
                .max_keys(MAX_LIST_KEYS);
            if let Some(t) = &token {
                list = list.continuation_token(t);
            }
            let output = list
                .send()
                .await
                .map_err(|err| backend::classify("get_bucket_info", err))?;
            for object in output.contents() {
                bytes += object.size().unwrap_or_default();
                count += 1;
            }
            if output.is_truncated().unwrap_or(false) {
                token = output.next_continuation_token().map(str::to_owned);
                if token.is_none() {
                    return Ok((bytes, count));
                }
            } else {
                return Ok((bytes, count));
            }
        }
    }

    async fn bucket_tags(&self, physical: &str) -> Result<HashMap<String, String>> {
        match self.s3.get_bucket_tagging().bucket(physical).send().await {
            Ok(output) => Ok(from_tag_set(output.tag_set())),
            Err(err) => match backend::classify("get_bucket_tags", err) {
                Error::NotFound(_) => Ok(HashMap::new()),
                other => Err(other),
            },
        }
    }

    async fn bucket_versioning(&self, physical: &str) -> Result<bool> {
        let output = self
            .s3
            .get_bucket_versioning()
            .bucket(physical)
            .send()
            .await
            .map_err(|err| backend::classify("get_bucket_versioning", err))?;
        Ok(matches!(
            output.status(),
            Some(&BucketVersioningStatus::Enabled)
        ))
    }

    async fn bucket_lifecycle(&self, physical: &str) -> Result<Option<String>> {
        match self
            .s3
            .get_bucket_lifecycle_configuration()
            .bucket(physical)
            .send()
            .await
        {
            Ok(output) => Ok(Some(lifecycle::render(output.rules()))),
            Err(err) => match backend::classify("get_bucket_lifecycle", err) {
                Error::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn do_put_object(
        &self,
        meta: proto_manifold::objectstore::PutObjectMetadata,
        frames: &mut Streaming<PutObjectRequest>,
    ) -> Result<PutObjectResponse> {
        let physical = tenant::bucket(&meta.user_id, &meta.logical_bucket)?;
        required("object_key", &meta.object_key)?;
        if meta.content_length < 0 {
            return Err(Error::InvalidArgument(
                "content_length must not be negative".to_string(),
            ));
        }

        let mut upload = StreamingUpload::new(
            self.s3.clone(),
            physical,
            meta.object_key.clone(),
            meta.content_type,
            meta.user_metadata,
            self.max_upload_bytes,
        );

        loop {
            match frames.message().await {
                Ok(Some(PutObjectRequest {
                    frame: Some(put_object_request::Frame::Chunk(chunk)),
                })) => {
                    if let Err(err) = upload.push(Bytes::from(chunk)).await {
                        upload.abort().await;
                        return Err(err);
                    }
                }
                Ok(Some(_)) => {
                    upload.abort().await;
                    return Err(Error::InvalidArgument(
                        "put_object: unexpected non-chunk frame mid-stream".to_string(),
                    ));
                }
                Ok(None) => break,
                Err(status) => {
                    // Client cancelled or the stream broke; no partial
                    // object may remain.
                    upload.abort().await;
                    return Err(Error::Internal(format!(
                        "put_object: inbound stream failed: {status}"
                    )));
                }
            }
        }

        let finished = upload.finish().await?;
        Ok(PutObjectResponse {
            object_key: meta.object_key,
            etag: finished.etag,
            version_id: finished.version_id,
            size: finished.size as i64,
        })
    }

    async fn do_get_object(
        &self,
        req: GetObjectRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = std::result::Result<GetObjectResponse, Status>> + Send>>>
    {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let mut get = self.s3.get_object().bucket(&physical).key(&req.object_key);
        if !req.version_id.is_empty() {
            get = get.version_id(&req.version_id);
        }
        if let Some(range) = byte_range(req.offset, req.length) {
            get = get.range(range);
        }

        let output = get
            .send()
            .await
            .map_err(|err| backend::classify("get_object", err))?;

        let metadata = ObjectMetadata {
            object_key: req.object_key.clone(),
            size: output.content_length().unwrap_or_default(),
            etag: trim_etag(output.e_tag()),
            content_type: output.content_type().unwrap_or_default().to_string(),
            version_id: output.version_id().unwrap_or_default().to_string(),
            last_modified: datetime_millis(output.last_modified()),
            user_metadata: output.metadata().cloned().unwrap_or_default(),
        };
        let mut body = output.body;

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tokio::spawn(async move {
            let first = GetObjectResponse {
                frame: Some(get_object_response::Frame::Metadata(metadata)),
            };
            if tx.send(Ok(first)).await.is_err() {
                return;
            }
            loop {
                match body.try_next().await {
                    Ok(Some(mut bytes)) => {
                        while !bytes.is_empty() {
                            let take = bytes.split_to(bytes.len().min(DOWNLOAD_CHUNK));
                            let frame = GetObjectResponse {
                                frame: Some(get_object_response::Frame::Chunk(take.to_vec())),
                            };
                            // A failed send means the client went away;
                            // dropping `body` stops the backend read.
                            if tx.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        let status =
                            Status::internal(format!("get_object: backend read failed: {err}"));
                        let _ = tx.send(Err(status)).await;
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn do_delete_object(&self, req: DeleteObjectRequest) -> Result<Ack> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let mut delete = self.s3.delete_object().bucket(&physical).key(&req.object_key);
        if !req.version_id.is_empty() {
            delete = delete.version_id(&req.version_id);
        }
        delete
            .send()
            .await
            .map_err(|err| backend::classify("delete_object", err))?;
        Ok(Ack {})
    }

    async fn do_delete_objects(&self, req: DeleteObjectsRequest) -> Result<DeleteObjectsResponse> {
        use proto_manifold::objectstore::delete_objects_response::Outcome;

        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        if req.object_keys.is_empty() {
            return Err(Error::InvalidArgument("object_keys is required".to_string()));
        }

        let identifiers: Vec<ObjectIdentifier> = req
            .object_keys
            .iter()
            .map(|key| {
                ObjectIdentifier::builder()
                    .key(key)
                    .build()
                    .map_err(|err| Error::InvalidArgument(format!("invalid key: {err}")))
            })
            .collect::<Result<_>>()?;

        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(false)
            .build()
            .map_err(|err| Error::Internal(format!("delete_objects: {err}")))?;

        let output = self
            .s3
            .delete_objects()
            .bucket(&physical)
            .delete(delete)
            .send()
            .await
            .map_err(|err| backend::classify("delete_objects", err))?;

        let mut errors: HashMap<String, String> = HashMap::new();
        for error in output.errors() {
            errors.insert(
                error.key().unwrap_or_default().to_string(),
                error.message().unwrap_or("delete failed").to_string(),
            );
        }

        let outcomes = req
            .object_keys
            .iter()
            .map(|key| match errors.get(key) {
                Some(message) => Outcome {
                    object_key: key.clone(),
                    deleted: false,
                    error: message.clone(),
                },
                None => Outcome {
                    object_key: key.clone(),
                    deleted: true,
                    error: String::new(),
                },
            })
            .collect();

        Ok(DeleteObjectsResponse { outcomes })
    }

    async fn do_list_objects(&self, req: ListObjectsRequest) -> Result<ListObjectsResponse> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;

        let mut list = self
            .s3
            .list_objects_v2()
            .bucket(&physical)
            .max_keys(effective_max_keys(req.max_keys));
        if !req.prefix.is_empty() {
            list = list.prefix(&req.prefix);
        }
        if !req.recursive {
            list = list.delimiter("/");
        }

        let output = list
            .send()
            .await
            .map_err(|err| backend::classify("list_objects", err))?;

        let mut objects: Vec<ObjectItem> = Vec::new();
        for prefix in output.common_prefixes() {
            objects.push(ObjectItem {
                object_key: prefix.prefix().unwrap_or_default().to_string(),
                size: 0,
                etag: String::new(),
                last_modified: 0,
                is_prefix: true,
            });
        }
        for object in output.contents() {
            objects.push(ObjectItem {
                object_key: object.key().unwrap_or_default().to_string(),
                size: object.size().unwrap_or_default(),
                etag: trim_etag(object.e_tag()),
                last_modified: datetime_millis(object.last_modified()),
                is_prefix: false,
            });
        }

        Ok(ListObjectsResponse {
            objects,
            is_truncated: output.is_truncated().unwrap_or(false),
        })
    }

    async fn do_copy_object(&self, req: CopyObjectRequest) -> Result<CopyObjectResponse> {
        // Both endpoints derive from the caller's identity, so a single RPC
        // can never copy across tenants.
        let src_bucket = tenant::bucket(&req.user_id, &req.source_bucket)?;
        let dst_bucket = tenant::bucket(&req.user_id, &req.destination_bucket)?;
        required("source_key", &req.source_key)?;
        required("destination_key", &req.destination_key)?;

        let copy_source = format!(
            "{src_bucket}/{}",
            utf8_percent_encode(&req.source_key, COPY_SOURCE_SET)
        );

        let mut copy = self
            .s3
            .copy_object()
            .copy_source(copy_source)
            .bucket(&dst_bucket)
            .key(&req.destination_key);
        if !req.user_metadata.is_empty() {
            copy = copy
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(Some(req.user_metadata.clone()));
        }

        let output = copy
            .send()
            .await
            .map_err(|err| backend::classify("copy_object", err))?;

        let result = output.copy_object_result();
        Ok(CopyObjectResponse {
            etag: trim_etag(result.and_then(|r| r.e_tag())),
            last_modified: datetime_millis(result.and_then(|r| r.last_modified())),
        })
    }

    async fn do_stat_object(&self, req: StatObjectRequest) -> Result<ObjectMetadata> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let mut head = self.s3.head_object().bucket(&physical).key(&req.object_key);
        if !req.version_id.is_empty() {
            head = head.version_id(&req.version_id);
        }
        let output = head
            .send()
            .await
            .map_err(|err| backend::classify("stat_object", err))?;

        Ok(ObjectMetadata {
            object_key: req.object_key,
            size: output.content_length().unwrap_or_default(),
            etag: trim_etag(output.e_tag()),
            content_type: output.content_type().unwrap_or_default().to_string(),
            version_id: output.version_id().unwrap_or_default().to_string(),
            last_modified: datetime_millis(output.last_modified()),
            user_metadata: output.metadata().cloned().unwrap_or_default(),
        })
    }

    async fn do_presign_get(&self, req: GetPresignedUrlRequest) -> Result<PresignedUrlResponse> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let expiry = clamp_expiry(req.expiry_seconds, DEFAULT_GET_EXPIRY_SECONDS);
        let config = PresigningConfig::expires_in(expiry)
            .map_err(|err| Error::InvalidArgument(format!("invalid expiry: {err}")))?;

        let presigned = self
            .s3
            .get_object()
            .bucket(&physical)
            .key(&req.object_key)
            .presigned(config)
            .await
            .map_err(|err| backend::classify("get_presigned_url", err))?;

        Ok(PresignedUrlResponse {
            url: presigned.uri().to_string(),
            expiry_seconds: expiry.as_secs() as i64,
        })
    }

    async fn do_presign_put(
        &self,
        req: GetPresignedPutUrlRequest,
    ) -> Result<PresignedUrlResponse> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let expiry = clamp_expiry(req.expiry_seconds, DEFAULT_PUT_EXPIRY_SECONDS);
        let config = PresigningConfig::expires_in(expiry)
            .map_err(|err| Error::InvalidArgument(format!("invalid expiry: {err}")))?;

        let presigned = self
            .s3
            .put_object()
            .bucket(&physical)
            .key(&req.object_key)
            .presigned(config)
            .await
            .map_err(|err| backend::classify("get_presigned_put_url", err))?;

        Ok(PresignedUrlResponse {
            url: presigned.uri().to_string(),
            expiry_seconds: expiry.as_secs() as i64,
        })
    }

    async fn do_initiate_multipart(
        &self,
        req: InitiateMultipartUploadRequest,
    ) -> Result<InitiateMultipartUploadResponse> {
        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;

        let mut create = self
            .s3
            .create_multipart_upload()
            .bucket(&physical)
            .key(&req.object_key);
        if !req.content_type.is_empty() {
            create = create.content_type(&req.content_type);
        }
        if !req.user_metadata.is_empty() {
            create = create.set_metadata(Some(req.user_metadata));
        }

        let output = create
            .send()
            .await
            .map_err(|err| backend::classify("initiate_multipart_upload", err))?;

        Ok(InitiateMultipartUploadResponse {
            upload_id: output.upload_id().unwrap_or_default().to_string(),
        })
    }

    async fn do_upload_part(
        &self,
        meta: proto_manifold::objectstore::UploadPartMetadata,
        frames: &mut Streaming<UploadPartRequest>,
    ) -> Result<UploadPartResponse> {
        let physical = tenant::bucket(&meta.user_id, &meta.logical_bucket)?;
        required("object_key", &meta.object_key)?;
        required("upload_id", &meta.upload_id)?;
        if !(1..=10_000).contains(&meta.part_number) {
            return Err(Error::InvalidArgument(
                "part_number must be between 1 and 10000".to_string(),
            ));
        }

        let mut buf = bytes::BytesMut::new();
        loop {
            match frames.message().await {
                Ok(Some(UploadPartRequest {
                    frame: Some(upload_part_request::Frame::Chunk(chunk)),
                })) => {
                    if buf.len() + chunk.len() > MAX_PART_BYTES {
                        return Err(Error::ResourceExhausted(format!(
                            "part exceeds the {MAX_PART_BYTES} byte buffer limit"
                        )));
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(Some(_)) => {
                    return Err(Error::InvalidArgument(
                        "upload_part: unexpected non-chunk frame mid-stream".to_string(),
                    ));
                }
                Ok(None) => break,
                Err(status) => {
                    return Err(Error::Internal(format!(
                        "upload_part: inbound stream failed: {status}"
                    )));
                }
            }
        }

        let output = self
            .s3
            .upload_part()
            .bucket(&physical)
            .key(&meta.object_key)
            .upload_id(&meta.upload_id)
            .part_number(meta.part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(buf.freeze()))
            .send()
            .await
            .map_err(|err| backend::classify("upload_part", err))?;

        Ok(UploadPartResponse {
            part_number: meta.part_number,
            etag: trim_etag(output.e_tag()),
        })
    }

    async fn do_complete_multipart(
        &self,
        req: CompleteMultipartUploadRequest,
    ) -> Result<CompleteMultipartUploadResponse> {
        use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};

        let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
        required("object_key", &req.object_key)?;
        required("upload_id", &req.upload_id)?;
        if req.parts.is_empty() {
            return Err(Error::InvalidArgument("parts is required".to_string()));
        }

        let mut parts = req.parts.clone();
        parts.sort_by_key(|p| p.part_number);
        let completed_parts: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let output = self
            .s3
            .complete_multipart_upload()
            .bucket(&physical)
            .key(&req.object_key)
            .upload_id(&req.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| backend::classify("complete_multipart_upload", err))?;

        Ok(CompleteMultipartUploadResponse {
            etag: trim_etag(output.e_tag()),
            object_key: req.object_key,
        })
    }
}

#[tonic::async_trait]
impl ObjectStore for ObjectStoreService {
    async fn create_bucket(
        &self,
        request: Request<CreateBucketRequest>,
    ) -> std::result::Result<Response<BucketInfo>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("create_bucket", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.logical_bucket.as_str());
        let result = self.do_create_bucket(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_buckets(
        &self,
        request: Request<ListBucketsRequest>,
    ) -> std::result::Result<Response<ListBucketsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_buckets", &req.user_id, &req.organization_id)?;
        let result = self.do_list_buckets(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_bucket(
        &self,
        request: Request<DeleteBucketRequest>,
    ) -> std::result::Result<Response<DeleteBucketResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_bucket", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.logical_bucket.as_str());
        scope.annotate("force", if req.force { "true" } else { "false" });
        let result = self.do_delete_bucket(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_bucket_info(
        &self,
        request: Request<GetBucketInfoRequest>,
    ) -> std::result::Result<Response<BucketInfo>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_bucket_info", &req.user_id, &req.organization_id)?;
        let result = self.do_get_bucket_info(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_bucket_policy(
        &self,
        request: Request<SetBucketPolicyRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_bucket_policy", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            serde_json::from_str::<serde_json::Value>(&req.policy_json)
                .map_err(|err| Error::InvalidArgument(format!("invalid policy: {err}")))?;
            self.s3
                .put_bucket_policy()
                .bucket(&physical)
                .policy(&req.policy_json)
                .send()
                .await
                .map_err(|err| backend::classify("set_bucket_policy", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_bucket_policy(
        &self,
        request: Request<GetBucketPolicyRequest>,
    ) -> std::result::Result<Response<GetBucketPolicyResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_bucket_policy", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            let output = self
                .s3
                .get_bucket_policy()
                .bucket(&physical)
                .send()
                .await
                .map_err(|err| backend::classify("get_bucket_policy", err))?;
            Ok(GetBucketPolicyResponse {
                policy_json: output.policy().unwrap_or_default().to_string(),
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_bucket_tags(
        &self,
        request: Request<SetBucketTagsRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_bucket_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            let tagging = Tagging::builder()
                .set_tag_set(Some(to_tag_set(&req.tags)?))
                .build()
                .map_err(|err| Error::InvalidArgument(format!("invalid tags: {err}")))?;
            self.s3
                .put_bucket_tagging()
                .bucket(&physical)
                .tagging(tagging)
                .send()
                .await
                .map_err(|err| backend::classify("set_bucket_tags", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_bucket_tags(
        &self,
        request: Request<GetBucketTagsRequest>,
    ) -> std::result::Result<Response<GetBucketTagsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_bucket_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            Ok(GetBucketTagsResponse {
                tags: self.bucket_tags(&physical).await?,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_bucket_tags(
        &self,
        request: Request<DeleteBucketTagsRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("delete_bucket_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            self.s3
                .delete_bucket_tagging()
                .bucket(&physical)
                .send()
                .await
                .map_err(|err| backend::classify("delete_bucket_tags", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_bucket_versioning(
        &self,
        request: Request<SetBucketVersioningRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("set_bucket_versioning", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            let status = if req.enabled {
                BucketVersioningStatus::Enabled
            } else {
                BucketVersioningStatus::Suspended
            };
            self.s3
                .put_bucket_versioning()
                .bucket(&physical)
                .versioning_configuration(
                    VersioningConfiguration::builder().status(status).build(),
                )
                .send()
                .await
                .map_err(|err| backend::classify("set_bucket_versioning", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_bucket_versioning(
        &self,
        request: Request<GetBucketVersioningRequest>,
    ) -> std::result::Result<Response<GetBucketVersioningResponse>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("get_bucket_versioning", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            Ok(GetBucketVersioningResponse {
                enabled: self.bucket_versioning(&physical).await?,
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_bucket_lifecycle(
        &self,
        request: Request<SetBucketLifecycleRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("set_bucket_lifecycle", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            let rules = lifecycle::parse(&req.lifecycle_json)?;
            let configuration = BucketLifecycleConfiguration::builder()
                .set_rules(Some(rules))
                .build()
                .map_err(|err| Error::InvalidArgument(format!("invalid lifecycle: {err}")))?;
            self.s3
                .put_bucket_lifecycle_configuration()
                .bucket(&physical)
                .lifecycle_configuration(configuration)
                .send()
                .await
                .map_err(|err| backend::classify("set_bucket_lifecycle", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_bucket_lifecycle(
        &self,
        request: Request<GetBucketLifecycleRequest>,
    ) -> std::result::Result<Response<GetBucketLifecycleResponse>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("get_bucket_lifecycle", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            match self.bucket_lifecycle(&physical).await? {
                Some(lifecycle_json) => Ok(GetBucketLifecycleResponse { lifecycle_json }),
                None => Err(Error::NotFound(format!(
                    "bucket '{}' has no lifecycle configuration",
                    req.logical_bucket
                ))),
            }
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_bucket_lifecycle(
        &self,
        request: Request<DeleteBucketLifecycleRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("delete_bucket_lifecycle", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            self.s3
                .delete_bucket_lifecycle()
                .bucket(&physical)
                .send()
                .await
                .map_err(|err| backend::classify("delete_bucket_lifecycle", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn put_object(
        &self,
        request: Request<Streaming<PutObjectRequest>>,
    ) -> std::result::Result<Response<PutObjectResponse>, Status> {
        let mut frames = request.into_inner();

        let meta = match frames.message().await {
            Ok(Some(PutObjectRequest {
                frame: Some(put_object_request::Frame::Metadata(meta)),
            })) => meta,
            Ok(_) => {
                return Err(Status::invalid_argument(
                    "first frame must carry object metadata",
                ))
            }
            Err(status) => return Err(status),
        };

        let mut scope = self
            .ctx
            .begin("put_object", &meta.user_id, &meta.organization_id)?;
        scope.annotate("bucket", meta.logical_bucket.as_str());
        scope.annotate("key", meta.object_key.as_str());
        let result = self.do_put_object(meta, &mut frames).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    type GetObjectStream =
        Pin<Box<dyn Stream<Item = std::result::Result<GetObjectResponse, Status>> + Send>>;

    async fn get_object(
        &self,
        request: Request<GetObjectRequest>,
    ) -> std::result::Result<Response<Self::GetObjectStream>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("get_object", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.logical_bucket.as_str());
        scope.annotate("key", req.object_key.as_str());
        let result = self.do_get_object(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_object(
        &self,
        request: Request<DeleteObjectRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_object", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.logical_bucket.as_str());
        scope.annotate("key", req.object_key.as_str());
        let result = self.do_delete_object(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_objects(
        &self,
        request: Request<DeleteObjectsRequest>,
    ) -> std::result::Result<Response<DeleteObjectsResponse>, Status> {
        let req = request.into_inner();
        let mut scope = self
            .ctx
            .begin("delete_objects", &req.user_id, &req.organization_id)?;
        scope.annotate("bucket", req.logical_bucket.as_str());
        scope.annotate("keys", req.object_keys.len().to_string());
        let result = self.do_delete_objects(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn list_objects(
        &self,
        request: Request<ListObjectsRequest>,
    ) -> std::result::Result<Response<ListObjectsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("list_objects", &req.user_id, &req.organization_id)?;
        let result = self.do_list_objects(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn copy_object(
        &self,
        request: Request<CopyObjectRequest>,
    ) -> std::result::Result<Response<CopyObjectResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("copy_object", &req.user_id, &req.organization_id)?;
        let result = self.do_copy_object(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn stat_object(
        &self,
        request: Request<StatObjectRequest>,
    ) -> std::result::Result<Response<ObjectMetadata>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("stat_object", &req.user_id, &req.organization_id)?;
        let result = self.do_stat_object(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn set_object_tags(
        &self,
        request: Request<SetObjectTagsRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("set_object_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            required("object_key", &req.object_key)?;
            let tagging = Tagging::builder()
                .set_tag_set(Some(to_tag_set(&req.tags)?))
                .build()
                .map_err(|err| Error::InvalidArgument(format!("invalid tags: {err}")))?;
            self.s3
                .put_object_tagging()
                .bucket(&physical)
                .key(&req.object_key)
                .tagging(tagging)
                .send()
                .await
                .map_err(|err| backend::classify("set_object_tags", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_object_tags(
        &self,
        request: Request<GetObjectTagsRequest>,
    ) -> std::result::Result<Response<GetObjectTagsResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_object_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            required("object_key", &req.object_key)?;
            let output = self
                .s3
                .get_object_tagging()
                .bucket(&physical)
                .key(&req.object_key)
                .send()
                .await
                .map_err(|err| backend::classify("get_object_tags", err))?;
            Ok(GetObjectTagsResponse {
                tags: from_tag_set(output.tag_set()),
            })
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn delete_object_tags(
        &self,
        request: Request<DeleteObjectTagsRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("delete_object_tags", &req.user_id, &req.organization_id)?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            required("object_key", &req.object_key)?;
            self.s3
                .delete_object_tagging()
                .bucket(&physical)
                .key(&req.object_key)
                .send()
                .await
                .map_err(|err| backend::classify("delete_object_tags", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_presigned_url(
        &self,
        request: Request<GetPresignedUrlRequest>,
    ) -> std::result::Result<Response<PresignedUrlResponse>, Status> {
        let req = request.into_inner();
        let scope = self
            .ctx
            .begin("get_presigned_url", &req.user_id, &req.organization_id)?;
        let result = self.do_presign_get(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn get_presigned_put_url(
        &self,
        request: Request<GetPresignedPutUrlRequest>,
    ) -> std::result::Result<Response<PresignedUrlResponse>, Status> {
        let req = request.into_inner();
        let scope =
            self.ctx
                .begin("get_presigned_put_url", &req.user_id, &req.organization_id)?;
        let result = self.do_presign_put(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn initiate_multipart_upload(
        &self,
        request: Request<InitiateMultipartUploadRequest>,
    ) -> std::result::Result<Response<InitiateMultipartUploadResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin(
            "initiate_multipart_upload",
            &req.user_id,
            &req.organization_id,
        )?;
        let result = self.do_initiate_multipart(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn upload_part(
        &self,
        request: Request<Streaming<UploadPartRequest>>,
    ) -> std::result::Result<Response<UploadPartResponse>, Status> {
        let mut frames = request.into_inner();

        let meta = match frames.message().await {
            Ok(Some(UploadPartRequest {
                frame: Some(upload_part_request::Frame::Metadata(meta)),
            })) => meta,
            Ok(_) => {
                return Err(Status::invalid_argument(
                    "first frame must carry part metadata",
                ))
            }
            Err(status) => return Err(status),
        };

        let mut scope = self
            .ctx
            .begin("upload_part", &meta.user_id, &meta.organization_id)?;
        scope.annotate("part", meta.part_number.to_string());
        let result = self.do_upload_part(meta, &mut frames).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn complete_multipart_upload(
        &self,
        request: Request<CompleteMultipartUploadRequest>,
    ) -> std::result::Result<Response<CompleteMultipartUploadResponse>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin(
            "complete_multipart_upload",
            &req.user_id,
            &req.organization_id,
        )?;
        let result = self.do_complete_multipart(req).await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn abort_multipart_upload(
        &self,
        request: Request<AbortMultipartUploadRequest>,
    ) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let scope = self.ctx.begin(
            "abort_multipart_upload",
            &req.user_id,
            &req.organization_id,
        )?;
        let result = async {
            let physical = tenant::bucket(&req.user_id, &req.logical_bucket)?;
            required("object_key", &req.object_key)?;
            required("upload_id", &req.upload_id)?;
            self.s3
                .abort_multipart_upload()
                .bucket(&physical)
                .key(&req.object_key)
                .upload_id(&req.upload_id)
                .send()
                .await
                .map_err(|err| backend::classify("abort_multipart_upload", err))?;
            Ok(Ack {})
        }
        .await;
        self.ctx.finish(scope, &result);
        result.map(Response::new).map_err(Into::into)
    }

    async fn health_check(
        &self,
        _request: Request<HealthCheckRequest>,
    ) -> std::result::Result<Response<HealthCheckResponse>, Status> {
        let response = match self.s3.list_buckets().send().await {
            Ok(_) => HealthCheckResponse {
                healthy: true,
                status: "connected".to_string(),
            },
            Err(err) => HealthCheckResponse {
                healthy: false,
                status: backend::classify("health_check", err).to_string(),
            },
        };
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_keys_is_capped() {
        assert_eq!(effective_max_keys(0), MAX_LIST_KEYS);
        assert_eq!(effective_max_keys(-5), MAX_LIST_KEYS);
        assert_eq!(effective_max_keys(10), 10);
        assert_eq!(effective_max_keys(5000), MAX_LIST_KEYS);
    }

    #[test]
    fn expiry_defaults_and_clamps() {
        assert_eq!(
            clamp_expiry(0, DEFAULT_PUT_EXPIRY_SECONDS),
            Duration::from_secs(3600)
        );
        assert_eq!(clamp_expiry(60, DEFAULT_PUT_EXPIRY_SECONDS), Duration::from_secs(60));
        assert_eq!(
            clamp_expiry(i64::MAX, DEFAULT_GET_EXPIRY_SECONDS),
            Duration::from_secs(MAX_PRESIGN_SECONDS)
        );
    }

    #[test]
    fn byte_ranges_cover_offset_and_length() {
        assert_eq!(byte_range(0, 0), None);
        assert_eq!(byte_range(10, 0).as_deref(), Some("bytes=10-"));
        assert_eq!(byte_range(10, 5).as_deref(), Some("bytes=10-14"));
        assert_eq!(byte_range(0, 5).as_deref(), Some("bytes=0-4"));
    }

    #[test]
    fn copy_source_escaping_keeps_path_separators() {
        let encoded =
            utf8_percent_encode("reports/2024 Q1 summary.pdf", COPY_SOURCE_SET).to_string();
        assert_eq!(encoded, "reports/2024%20Q1%20summary.pdf");
    }

    #[test]
    fn required_rejects_empty_fields() {
        assert!(required("object_key", "").is_err());
        assert!(required("object_key", "a.txt").is_ok());
    }
}
