//! S3-compatible object storage backend built on `aws-sdk-s3`.

use std::ops::Range;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BackendError, BackendErrorKind, BackendResult, ObjectBackend, ObjectMeta};

/// Connection parameters for an S3-compatible endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Options {
    pub bucket: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Custom endpoint (MinIO, Ceph RGW, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

/// Object store backend for one bucket.
///
/// The SDK's own retry layer is disabled; the executor's retry policy is
/// the only one in play.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Builds a client from the ambient AWS configuration plus `options`.
    pub async fn connect(options: &S3Options) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &options.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &options.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        let conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(options.force_path_style)
            .retry_config(RetryConfig::disabled())
            .build();
        debug!(bucket = %options.bucket, endpoint = ?options.endpoint, "S3 client ready");
        Self::from_client(Client::from_conf(conf), options.bucket.clone())
    }

    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn to_system_time(t: Option<&DateTime>) -> Option<SystemTime> {
    t.and_then(|t| SystemTime::try_from(*t).ok())
}

fn classify<E>(err: &SdkError<E, HttpResponse>, key: &str) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let kind = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            BackendErrorKind::Transient
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            match (service.err().code(), status) {
                (Some("NoSuchKey" | "NotFound"), _) | (_, 404) => BackendErrorKind::NotFound,
                (Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"), _) => {
                    BackendErrorKind::Transient
                }
                (_, 429 | 500 | 502 | 503 | 504) => BackendErrorKind::Transient,
                _ => BackendErrorKind::Fatal,
            }
        }
        _ => BackendErrorKind::Fatal,
    };
    BackendError::new(kind, format!("{key:?}: {}", DisplayErrorContext(err)))
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn stat(&self, key: &str) -> BackendResult<ObjectMeta> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: head.content_length().map_or(0, |len| len.max(0) as u64),
            last_modified: to_system_time(head.last_modified()),
            is_dir: key.ends_with('/'),
        })
    }

    async fn get(&self, key: &str, range: Option<Range<u64>>) -> BackendResult<Bytes> {
        if let Some(r) = &range
            && r.start >= r.end
        {
            return Ok(Bytes::new());
        }
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .set_range(range.map(|r| format!("bytes={}-{}", r.start, r.end - 1)))
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| BackendError::transient(format!("{key:?}: reading body: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, data: Bytes) -> BackendResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&e, key))?;
        Ok(())
    }

    async fn list(&self, prefix: &str, recursive: bool) -> BackendResult<Vec<ObjectMeta>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_delimiter((!recursive).then(|| "/".to_string()))
            .into_paginator()
            .send();
        let mut out = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify(&e, prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                out.push(ObjectMeta {
                    key: key.to_string(),
                    size: object.size().map_or(0, |s| s.max(0) as u64),
                    last_modified: to_system_time(object.last_modified()),
                    is_dir: key.ends_with('/'),
                });
            }
            for common in page.common_prefixes() {
                if let Some(p) = common.prefix() {
                    out.push(ObjectMeta::prefix(p));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires an S3 endpoint (BUCKETFS_S3_BUCKET, AWS_ENDPOINT_URL)"]
    async fn test_round_trip_against_live_bucket() {
        let bucket = std::env::var("BUCKETFS_S3_BUCKET").unwrap();
        let backend = S3Backend::connect(&S3Options {
            bucket,
            force_path_style: true,
            ..S3Options::default()
        })
        .await;
        backend.put("bucketfs-test/obj", Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(backend.get("bucketfs-test/obj", Some(0..3)).await.unwrap(), "pay");
        backend.delete("bucketfs-test/obj").await.unwrap();
        assert!(backend.stat("bucketfs-test/obj").await.unwrap_err().is_not_found());
    }
}
