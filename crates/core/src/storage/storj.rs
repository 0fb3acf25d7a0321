//! Storj backend through its S3-compatible gateway.
//!
//! The access grant is registered once with the Storj auth service, which
//! returns gateway credentials used for every later call. Expiry is set at
//! upload through the gateway's `object-expires` metadata, so purging is a no-op.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::{BodyStream, Download, Storage, StorageKind, StorageResult, metadata_key, object_key};
use super::error::StorageError;
use super::metadata::Metadata;
use super::range::Range;
use super::s3::{BucketClient, Endpoint, ObjectHeaders};

const BACKEND: &str = "storj";

/// Parts uploaded concurrently to the gateway.
const UPLOAD_CONCURRENCY: usize = 4;

/// Gateway metadata key carrying the object's expiry.
const EXPIRES_KEY: &str = "object-expires";

#[derive(Debug, Serialize)]
struct RegisterAccess<'a> {
    access_grant: &'a str,
    public: bool,
}

#[derive(Debug, Deserialize)]
struct GatewayCredentials {
    access_key_id: String,
    secret_key: String,
    endpoint: String,
}

/// Objects in a Storj bucket.
#[derive(Debug)]
pub struct StorjStorage {
    bucket: BucketClient,
    retention: Option<Duration>,
}

impl StorjStorage {
    /// Register `access_grant`, connect to the gateway and ensure `bucket` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the grant is rejected or the bucket cannot be created.
    pub async fn new(
        access_grant: &str,
        bucket: &str,
        auth_service_url: &str,
        retention: Option<Duration>,
    ) -> StorageResult<Self> {
        if access_grant.is_empty() || bucket.is_empty() {
            return Err(StorageError::configuration(
                "storj access grant and bucket are required",
            ));
        }

        let credentials = register_access(auth_service_url, access_grant).await?;
        let endpoint = Endpoint {
            region: "global",
            url: Some(&credentials.endpoint),
            access_key_id: &credentials.access_key_id,
            secret_access_key: &credentials.secret_key,
            force_path_style: true,
        };
        let client = BucketClient::connect(&endpoint, bucket, BACKEND, UPLOAD_CONCURRENCY).await;
        client.ensure_bucket().await?;

        info!(bucket, gateway = %credentials.endpoint, "Storj storage ready");
        Ok(Self {
            bucket: client,
            retention,
        })
    }

    fn upload_headers(&self, content_type: &str, now: DateTime<Utc>) -> StorageResult<ObjectHeaders> {
        let mut headers = ObjectHeaders {
            content_type: content_type.to_string(),
            ..ObjectHeaders::default()
        };
        headers
            .metadata
            .insert("content-type".to_string(), content_type.to_string());
        if let Some(expires) = self.expiry(now)? {
            headers
                .metadata
                .insert(EXPIRES_KEY.to_string(), expires.to_rfc3339());
        }
        Ok(headers)
    }

    fn expiry(&self, now: DateTime<Utc>) -> StorageResult<Option<DateTime<Utc>>> {
        self.retention
            .map(|retention| {
                chrono::Duration::from_std(retention)
                    .map(|retention| now + retention)
                    .map_err(|e| StorageError::configuration(e.to_string()))
            })
            .transpose()
    }

    async fn write_sidecar(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        let raw = metadata.to_json()?;
        self.bucket
            .put_bytes(&metadata_key(token, filename), Bytes::from(raw), "application/json")
            .await
    }
}

async fn register_access(auth_service_url: &str, access_grant: &str) -> StorageResult<GatewayCredentials> {
    let url = format!("{}/v1/access", auth_service_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&RegisterAccess {
            access_grant,
            public: false,
        })
        .send()
        .await
        .map_err(|e| StorageError::provider(BACKEND, e.to_string()))?;

    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(StorageError::Unauthorized(format!(
            "storj auth service rejected the access grant ({status})"
        )));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StorageError::provider(
            BACKEND,
            format!("access registration failed ({status}): {body}"),
        ));
    }

    response
        .json::<GatewayCredentials>()
        .await
        .map_err(|e| StorageError::provider(BACKEND, e.to_string()))
}

#[async_trait]
impl Storage for StorjStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Storj
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
        debug!(backend = BACKEND, key, "Streaming object");
        self.bucket.get(&key, range).await
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
        let now = Utc::now();
        let headers = self.upload_headers(content_type, now)?;
        self.bucket.upload(&key, body, content_length, &headers).await?;

        let mut metadata = Metadata::new(content_type, content_length);
        metadata.max_date = self.expiry(now)?;
        if let Err(err) = self.write_sidecar(token, filename, &metadata).await {
            if let Err(cleanup) = self.bucket.delete(&key).await {
                warn!(backend = BACKEND, key, error = %cleanup, "Failed to remove upload without metadata");
            }
            return Err(err);
        }
        Ok(())
    }

    async fn metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        match self.bucket.read_bytes(&metadata_key(token, filename)).await {
            Ok(raw) => Metadata::from_json(&key, &raw),
            Err(err) if err.is_not_found() => {
                self.bucket.head(&key).await?;
                Err(StorageError::integrity(key, "metadata sidecar missing"))
            }
            Err(err) => Err(err),
        }
    }

    async fn meta(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        self.bucket.head(&object_key(token, filename)).await?;
        self.write_sidecar(token, filename, metadata).await
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        let sidecar = metadata_key(token, filename);
        if let Err(err) = self.bucket.delete(&sidecar).await {
            warn!(backend = BACKEND, key = sidecar, error = %err, "Failed to delete metadata object");
        }

        let key = object_key(token, filename);
        self.bucket.head(&key).await?;
        self.bucket.delete(&key).await?;
        debug!(backend = BACKEND, key, "Deleted object");
        Ok(())
    }

    async fn purge(&self, _max_age: Duration) -> StorageResult<()> {
        debug!(bucket = %self.bucket.bucket(), "Storj expiry is set at upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Auth service and gateway both served by `server`, with the bucket present.
    async fn mock_gateway(server: &MockServer) -> StorjStorage {
        Mock::given(method("POST"))
            .and(path("/v1/access"))
            .and(body_json(serde_json::json!({"access_grant": "1grant", "public": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_key_id": "jw",
                "secret_key": "jx",
                "endpoint": server.uri(),
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(path_regex("^/uploads/?$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;

        StorjStorage::new("1grant", "uploads", &server.uri(), None)
            .await
            .unwrap()
    }

    #[test]
    fn test_register_payload() {
        let payload = serde_json::to_value(RegisterAccess {
            access_grant: "1grant",
            public: false,
        })
        .unwrap();
        assert_eq!(
            payload,
            serde_json::json!({"access_grant": "1grant", "public": false})
        );
    }

    #[test]
    fn test_gateway_credentials_parse() {
        let raw = r#"{"access_key_id":"jw","secret_key":"jx","endpoint":"https://gateway.storjshare.io"}"#;
        let creds: GatewayCredentials = serde_json::from_str(raw).unwrap();
        assert_eq!(creds.access_key_id, "jw");
        assert_eq!(creds.secret_key, "jx");
        assert_eq!(creds.endpoint, "https://gateway.storjshare.io");
    }

    async fn offline(retention: Option<Duration>) -> StorjStorage {
        let endpoint = Endpoint {
            region: "global",
            url: Some("http://127.0.0.1:1"),
            access_key_id: "jw",
            secret_access_key: "jx",
            force_path_style: true,
        };
        StorjStorage {
            bucket: BucketClient::connect(&endpoint, "uploads", BACKEND, 1).await,
            retention,
        }
    }

    #[tokio::test]
    async fn test_upload_headers_set_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let storage = offline(Some(Duration::from_secs(2 * 86_400))).await;
        let headers = storage.upload_headers("image/png", now).unwrap();
        assert_eq!(headers.content_type, "image/png");
        assert_eq!(headers.metadata["content-type"], "image/png");
        assert_eq!(
            headers.metadata[EXPIRES_KEY],
            "2024-05-03T00:00:00+00:00"
        );

        let storage = offline(None).await;
        let headers = storage.upload_headers("image/png", now).unwrap();
        assert!(!headers.metadata.contains_key(EXPIRES_KEY));
    }

    #[tokio::test]
    async fn test_new_requires_grant() {
        let err = StorjStorage::new("", "uploads", "http://127.0.0.1:1", None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_missing_object_and_sidecar_is_not_found() {
        let server = MockServer::start().await;
        let storage = mock_gateway(&server).await;
        Mock::given(method("GET"))
            .and(path("/uploads/tok/f.txt.metadata"))
            .respond_with(ResponseTemplate::new(404).set_body_string(
                "<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
            ))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/uploads/tok/f.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = storage.metadata("tok", "f.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(storage.is_not_exist(&err));
    }

    #[tokio::test]
    async fn test_rejected_grant_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/access"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = StorjStorage::new("1grant", "uploads", &server.uri(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unauthorized(_)));
    }
}
