//! S3 blob store.
//!
//! Production backend. Conditional writes use S3's `If-Match` /
//! `If-None-Match` preconditions; a failed precondition (HTTP 412, or
//! 409 while S3 settles concurrent conditional writes) is reported as a
//! conflict outcome rather than an error.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::blob_store::{BlobMeta, BlobStore, BlobStoreError, PutOutcome};
use crate::config::S3Config;

/// Blob store over an S3 bucket.
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    public_base_url: String,
}

impl S3BlobStore {
    /// Create a store from configuration.
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());
        let public_base_url = public_base_url(config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            public_base_url = %public_base_url,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_base_url,
        })
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.public_base_url, key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<BlobMeta, BlobStoreError> {
        let size_bytes = bytes.len() as u64;
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobStoreError::Write(format!("{}", DisplayErrorContext(&e))))?;

        debug!(key = %key, "Blob uploaded to S3");

        Ok(BlobMeta {
            key: key.to_string(),
            url: self.url_for(key),
            size_bytes,
            uploaded_at: Utc::now(),
            etag: response.e_tag().map(String::from),
        })
    }

    #[instrument(skip(self, bytes), fields(key = %key, size_bytes = bytes.len()))]
    async fn put_conditional(
        &self,
        key: &str,
        bytes: Bytes,
        content_type: &str,
        expected_etag: Option<String>,
    ) -> Result<PutOutcome, BlobStoreError> {
        let size_bytes = bytes.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type);

        request = match expected_etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(response) => Ok(PutOutcome::Stored(BlobMeta {
                key: key.to_string(),
                url: self.url_for(key),
                size_bytes,
                uploaded_at: Utc::now(),
                etag: response.e_tag().map(String::from),
            })),
            Err(e) => {
                if let SdkError::ServiceError(ref ctx) = e {
                    let status = ctx.raw().status().as_u16();
                    if status == 412 || status == 409 {
                        debug!(key = %key, status, "Conditional write lost the race");
                        return Ok(PutOutcome::Conflict);
                    }
                }
                Err(BlobStoreError::Write(format!("{}", DisplayErrorContext(&e))))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobStoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(BlobStoreError::Read(format!("{}", DisplayErrorContext(&e))));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BlobStoreError::Read(e.to_string()))?;
        Ok(Some(data.into_bytes()))
    }

    async fn head(&self, key: &str) -> Result<Option<BlobMeta>, BlobStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => Ok(Some(BlobMeta {
                key: key.to_string(),
                url: self.url_for(key),
                size_bytes: response.content_length().unwrap_or(0).max(0) as u64,
                uploaded_at: response
                    .last_modified()
                    .and_then(smithy_to_chrono)
                    .unwrap_or_else(Utc::now),
                etag: response.e_tag().map(String::from),
            })),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(None)
                } else {
                    Err(BlobStoreError::Read(format!("{}", DisplayErrorContext(&e))))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobStoreError> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .map_err(|e| BlobStoreError::List(format!("{}", DisplayErrorContext(&e))))?;

        let metas = response
            .contents()
            .iter()
            .filter_map(|object| {
                let key = object.key()?.to_string();
                Some(BlobMeta {
                    url: self.url_for(&key),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    uploaded_at: object
                        .last_modified()
                        .and_then(smithy_to_chrono)
                        .unwrap_or_else(Utc::now),
                    etag: object.e_tag().map(String::from),
                    key,
                })
            })
            .collect();

        Ok(metas)
    }
}

/// Public base URL for stored objects: the configured override, or the
/// bucket's virtual-hosted AWS endpoint.
fn public_base_url(config: &S3Config) -> String {
    match config.public_base_url {
        Some(ref base) => base.trim_end_matches('/').to_string(),
        None => format!("https://{}.s3.{}.amazonaws.com", config.bucket, config.region),
    }
}

fn smithy_to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}
