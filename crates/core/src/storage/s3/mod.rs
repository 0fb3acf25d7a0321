//! S3-compatible backend: AWS S3, MinIO, Cloudflare R2, DigitalOcean Spaces.
//!
//! Objects are stored under `token/filename`. Their [`Metadata`] lives in the
//! object's own user-metadata headers, rewritten in place with a self-copy,
//! and the expiry is handed to the provider through the native `Expires` header.

mod client;

pub(crate) use client::{BucketClient, Endpoint, ObjectHeaders, PartReader};

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::backend::{BodyStream, Download, Storage, StorageKind, StorageResult, metadata_key, object_key};
use super::error::StorageError;
use super::metadata::Metadata;
use super::range::Range;

/// Parts uploaded concurrently unless multipart is disabled.
const UPLOAD_CONCURRENCY: usize = 20;

/// Construction parameters of [`S3Storage`].
#[derive(Debug, Clone)]
pub struct S3Options {
    /// Bucket name.
    pub bucket: String,
    /// Region.
    pub region: String,
    /// Custom endpoint for S3-compatible providers.
    pub endpoint: Option<String>,
    /// Access key ID.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Path-style bucket addressing.
    pub force_path_style: bool,
    /// Upload one part at a time.
    pub disable_multipart: bool,
    /// Native expiry applied to every upload.
    pub retention: Option<Duration>,
}

/// Objects in an S3 bucket.
#[derive(Debug)]
pub struct S3Storage {
    bucket: BucketClient,
    retention: Option<Duration>,
}

impl S3Storage {
    /// Connect to the configured bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket name or region is empty.
    pub async fn new(options: S3Options) -> StorageResult<Self> {
        if options.bucket.is_empty() || options.region.is_empty() {
            return Err(StorageError::configuration("s3 bucket and region are required"));
        }

        let concurrency = if options.disable_multipart {
            1
        } else {
            UPLOAD_CONCURRENCY
        };
        let endpoint = Endpoint {
            region: &options.region,
            url: options.endpoint.as_deref(),
            access_key_id: &options.access_key_id,
            secret_access_key: &options.secret_access_key,
            force_path_style: options.force_path_style,
        };
        let bucket = BucketClient::connect(&endpoint, &options.bucket, "s3", concurrency).await;

        info!(bucket = %options.bucket, region = %options.region, concurrency, "S3 storage ready");
        Ok(Self {
            bucket,
            retention: options.retention,
        })
    }
}

/// Object headers carrying `metadata`, with the expiry as native `Expires`.
fn object_headers(metadata: &Metadata) -> ObjectHeaders {
    ObjectHeaders {
        content_type: metadata.content_type.clone(),
        metadata: metadata.to_properties(),
        expires: metadata.max_date,
    }
}

#[async_trait]
impl Storage for S3Storage {
    fn kind(&self) -> StorageKind {
        StorageKind::S3
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<u64> {
        let key = object_key(token, filename);
        Ok(self.bucket.head(&key).await?.content_length)
    }

    async fn get(
        &self,
        token: &str,
        filename: &str,
        range: Option<Range>,
    ) -> StorageResult<Download> {
        let key = object_key(token, filename);
        let download = self.bucket.get(&key, range).await?;
        debug!(backend = "s3", key, bytes = download.content_length, "Streaming object");
        Ok(download)
    }

    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: BodyStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        let key = object_key(token, filename);
        let mut metadata = Metadata::new(content_type, content_length);
        if let Some(retention) = self.retention {
            let retention = chrono::Duration::from_std(retention)
                .map_err(|e| StorageError::configuration(e.to_string()))?;
            metadata.max_date = Some(Utc::now() + retention);
        }

        self.bucket
            .upload(&key, body, content_length, &object_headers(&metadata))
            .await
    }

    async fn metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        let head = self.bucket.head(&key).await?;
        let mut metadata = Metadata::from_properties(
            &key,
            &head.metadata,
            head.content_type.unwrap_or_default(),
            head.content_length,
        )?;
        if metadata.max_date.is_none() {
            metadata.max_date = head.expires;
        }
        Ok(metadata)
    }

    async fn meta(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        let key = object_key(token, filename);
        self.bucket
            .rewrite_headers(&key, &object_headers(metadata))
            .await
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        let sidecar = metadata_key(token, filename);
        if let Err(err) = self.bucket.delete(&sidecar).await {
            warn!(backend = "s3", key = sidecar, error = %err, "Failed to delete metadata object");
        }

        let key = object_key(token, filename);
        self.bucket.head(&key).await?;
        self.bucket.delete(&key).await
    }

    async fn purge(&self, _max_age: Duration) -> StorageResult<()> {
        debug!(bucket = %self.bucket.bucket(), "S3 expiry is handled by the provider");
        Ok(())
    }
}
