//! S3-compatible object store backend.
//!
//! Works against AWS S3 and any endpoint speaking the same API (MinIO,
//! LocalStack). There is no server-side rename, so [`S3Backend::rename`]
//! is a copy followed by a delete; see [`StorageBackend`] for what readers
//! may observe in between.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::{ByteStream as S3Body, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use aws_sdk_s3::Client;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::error::{Operation, StoreError, StoreResult};
use crate::traits::{
    Metadata, ObjectInfo, ObjectReader, ObjectStat, PartReceipt, StorageBackend, UploadId,
};

/// Backend over one bucket, optionally scoped to a key prefix.
#[derive(Clone, Debug)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: String::new(),
        }
    }

    /// Build a client from the ambient AWS configuration (environment,
    /// profile, instance metadata). A custom `endpoint` switches to
    /// path-style addressing, which MinIO and LocalStack expect.
    pub async fn from_config(
        bucket: impl Into<String>,
        region: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut config = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = endpoint {
            config = config.endpoint_url(endpoint).force_path_style(true);
        }
        Self::new(Client::from_conf(config.build()), bucket)
    }

    /// Scope every key under `prefix` inside the bucket.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix, key)
        }
    }

    fn strip_prefix<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        if self.prefix.is_empty() {
            Some(object_key)
        } else {
            object_key
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
        }
    }
}

fn sdk_error(op: Operation, key: &str, err: impl std::error::Error) -> StoreError {
    StoreError::backend(op, key, DisplayErrorContext(err))
}

fn to_system_time(time: Option<&DateTime>) -> SystemTime {
    time.and_then(|t| SystemTime::try_from(*t).ok())
        .unwrap_or(UNIX_EPOCH)
}

fn to_size(len: Option<i64>) -> u64 {
    len.and_then(|n| u64::try_from(n).ok()).unwrap_or(0)
}

fn to_header_map(metadata: Option<Metadata>) -> Option<HashMap<String, String>> {
    metadata.map(|m| m.into_iter().collect())
}

/// Percent-encode a key for the `x-amz-copy-source` header. Path separators
/// and RFC 3986 unreserved characters pass through.
fn encode_copy_source(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn open_reader(&self, key: &str) -> StoreResult<ObjectReader> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StoreError::NotFound(key.to_string())
                } else {
                    sdk_error(Operation::Read, key, e)
                }
            })?;

        let size = to_size(output.content_length());
        let owned_key = key.to_string();
        let chunks = stream::try_unfold(
            (output.body, owned_key),
            |(mut body, key): (S3Body, String)| async move {
                match body.next().await {
                    Some(Ok(chunk)) => Ok(Some((chunk, (body, key)))),
                    Some(Err(e)) => Err(sdk_error(Operation::Read, &key, e)),
                    None => Ok(None),
                }
            },
        );
        Ok(ObjectReader {
            size,
            stream: chunks.boxed(),
        })
    }

    async fn write(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> StoreResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(S3Body::from(data))
            .set_metadata(to_header_map(metadata))
            .send()
            .await
            .map_err(|e| sdk_error(Operation::Write, key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        // S3 deletes of missing keys succeed silently; look first so callers
        // get the same NotFound the other backends report.
        self.stat(key).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| sdk_error(Operation::Delete, key, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.object_key(prefix))
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error(Operation::List, prefix, e))?;
            for object in page.contents() {
                let Some(key) = object.key().and_then(|k| self.strip_prefix(k)) else {
                    continue;
                };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: to_size(object.size()),
                    last_modified: to_system_time(object.last_modified()),
                });
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectStat> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_not_found()) {
                    StoreError::NotFound(key.to_string())
                } else {
                    sdk_error(Operation::Stat, key, e)
                }
            })?;

        let metadata = output
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Ok(ObjectStat {
            info: ObjectInfo {
                key: key.to_string(),
                size: to_size(output.content_length()),
                last_modified: to_system_time(output.last_modified()),
            },
            metadata,
        })
    }

    async fn rename(&self, from: &str, to: &str, metadata: Option<Metadata>) -> StoreResult<()> {
        let source = format!("{}/{}", self.bucket, encode_copy_source(&self.object_key(from)));
        self.client
            .copy_object()
            .copy_source(source)
            .bucket(&self.bucket)
            .key(self.object_key(to))
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(to_header_map(metadata))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().and_then(|s| s.code()) == Some("NoSuchKey") {
                    StoreError::NotFound(from.to_string())
                } else {
                    sdk_error(Operation::Rename, from, e)
                }
            })?;

        // The copy is visible from here on. A failed delete leaves both keys
        // in place until something cleans up the source.
        if let Err(e) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(from))
            .send()
            .await
        {
            warn!(from, to, error = %DisplayErrorContext(&e), "rename copied but source delete failed");
            return Err(sdk_error(Operation::Rename, from, e));
        }
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> StoreResult<UploadId> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| sdk_error(Operation::Upload, key, e))?;
        let id = output
            .upload_id()
            .ok_or_else(|| StoreError::backend(Operation::Upload, key, "no upload id returned"))?
            .to_string();
        debug!(key, upload = %id, "multipart upload started");
        Ok(UploadId {
            key: key.to_string(),
            id,
        })
    }

    async fn upload_part(
        &self,
        upload: &UploadId,
        number: u32,
        data: Bytes,
    ) -> StoreResult<PartReceipt> {
        let part_number = i32::try_from(number).map_err(|_| {
            StoreError::backend(Operation::Upload, &upload.key, format!("part number {number} out of range"))
        })?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.object_key(&upload.key))
            .upload_id(&upload.id)
            .part_number(part_number)
            .body(S3Body::from(data))
            .send()
            .await
            .map_err(|e| sdk_error(Operation::Upload, &upload.key, e))?;
        Ok(PartReceipt {
            number,
            etag: output.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete_upload(&self, upload: &UploadId, parts: Vec<PartReceipt>) -> StoreResult<()> {
        let parts = parts
            .into_iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.number as i32)
                    .e_tag(p.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(&upload.key))
            .upload_id(&upload.id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().and_then(|s| s.code()) == Some("NoSuchUpload") {
                    StoreError::UnknownUpload(upload.id.clone())
                } else {
                    sdk_error(Operation::Upload, &upload.key, e)
                }
            })?;
        Ok(())
    }

    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(&upload.key))
            .upload_id(&upload.id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_upload()) => Ok(()),
            Err(e) => Err(sdk_error(Operation::Upload, &upload.key, e)),
        }
    }
}
