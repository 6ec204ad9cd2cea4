//! Streaming upload pipe between an inbound gRPC byte stream and the
//! backend's upload APIs.
//!
//! Small objects are written with a single put; once the buffered bytes
//! cross one part size the upload switches to multipart, so memory use is
//! bounded by the part size rather than the object size. Any failure after
//! a multipart upload has started must abort it so no zombie parts remain.

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::{Bytes, BytesMut};
use manifold_core::{Error, Result};
use std::collections::HashMap;

use crate::backend;

/// Part size for multipart uploads; also the single-put threshold.
pub const PART_SIZE: usize = 8 * (1 << 20);

pub struct StreamingUpload {
    s3: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    content_type: String,
    user_metadata: HashMap<String, String>,
    max_bytes: u64,

    buf: BytesMut,
    total: u64,
    upload_id: Option<String>,
    parts: Vec<CompletedPart>,
    next_part_number: i32,
}

pub struct FinishedUpload {
    pub etag: String,
    pub version_id: String,
    pub size: u64,
}

impl StreamingUpload {
    pub fn new(
        s3: aws_sdk_s3::Client,
        bucket: String,
        key: String,
        content_type: String,
        user_metadata: HashMap<String, String>,
        max_bytes: u64,
    ) -> Self {
        Self {
            s3,
            bucket,
            key,
            content_type,
            user_metadata,
            max_bytes,
            buf: BytesMut::new(),
            total: 0,
            upload_id: None,
            parts: Vec::new(),
            next_part_number: 1,
        }
    }

    /// Append one inbound chunk, flushing full parts to the backend as the
    /// buffer fills. The caller must `abort` on error.
    pub async fn push(&mut self, chunk: Bytes) -> Result<()> {
        self.total += chunk.len() as u64;
        if self.total > self.max_bytes {
            return Err(Error::InvalidArgument(format!(
                "object exceeds the upload limit of {} bytes",
                self.max_bytes
            )));
        }
        self.buf.extend_from_slice(&chunk);

        while self.buf.len() >= PART_SIZE {
            let part = self.buf.split_to(PART_SIZE).freeze();
            self.flush_part(part).await?;
        }
        Ok(())
    }

    async fn ensure_multipart(&mut self) -> Result<String> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let mut create = self
            .s3
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key);
        if !self.content_type.is_empty() {
            create = create.content_type(&self.content_type);
        }
        if !self.user_metadata.is_empty() {
            create = create.set_metadata(Some(self.user_metadata.clone()));
        }
        let output = create
            .send()
            .await
            .map_err(|err| backend::classify("put_object", err))?;
        let id = output.upload_id().unwrap_or_default().to_string();
        if id.is_empty() {
            return Err(Error::Internal(
                "put_object: backend returned no upload id".to_string(),
            ));
        }
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    async fn flush_part(&mut self, part: Bytes) -> Result<()> {
        let upload_id = self.ensure_multipart().await?;
        let part_number = self.next_part_number;
        self.next_part_number += 1;

        let output = self
            .s3
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(part))
            .send()
            .await
            .map_err(|err| backend::classify("put_object", err))?;

        self.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(output.e_tag().unwrap_or_default())
                .build(),
        );
        Ok(())
    }

    /// Close the upload. Multipart failures abort before surfacing the
    /// error; a zero-byte upload yields a valid empty object.
    pub async fn finish(mut self) -> Result<FinishedUpload> {
        if self.upload_id.is_none() {
            let body = std::mem::take(&mut self.buf).freeze();
            let mut put = self
                .s3
                .put_object()
                .bucket(&self.bucket)
                .key(&self.key)
                .body(ByteStream::from(body));
            if !self.content_type.is_empty() {
                put = put.content_type(&self.content_type);
            }
            if !self.user_metadata.is_empty() {
                put = put.set_metadata(Some(self.user_metadata.clone()));
            }
            let output = put
                .send()
                .await
                .map_err(|err| backend::classify("put_object", err))?;
            return Ok(FinishedUpload {
                etag: trim_etag(output.e_tag()),
                version_id: output.version_id().unwrap_or_default().to_string(),
                size: self.total,
            });
        }

        let result = self.finish_multipart().await;
        match result {
            Ok(finished) => Ok(finished),
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    async fn finish_multipart(&mut self) -> Result<FinishedUpload> {
        if !self.buf.is_empty() {
            let tail = std::mem::take(&mut self.buf).freeze();
            self.flush_part(tail).await?;
        }
        let upload_id = self.upload_id.clone().unwrap_or_default();

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();

        let output = self
            .s3
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|err| backend::classify("put_object", err))?;

        Ok(FinishedUpload {
            etag: trim_etag(output.e_tag()),
            version_id: output.version_id().unwrap_or_default().to_string(),
            size: self.total,
        })
    }

    /// Best-effort abort of an in-flight multipart upload.
    pub async fn abort(self) {
        let Some(upload_id) = self.upload_id else {
            return;
        };
        if let Err(err) = self
            .s3
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&upload_id)
            .send()
            .await
        {
            tracing::warn!(
                bucket = %self.bucket,
                key = %self.key,
                error = ?err,
                "failed to abort multipart upload"
            );
        }
    }
}

/// S3 etags arrive wrapped in double quotes.
pub fn trim_etag(etag: Option<&str>) -> String {
    etag.unwrap_or_default().trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etags_are_unquoted() {
        assert_eq!(trim_etag(Some("\"abc123\"")), "abc123");
        assert_eq!(trim_etag(Some("abc123")), "abc123");
        assert_eq!(trim_etag(None), "");
    }
}
