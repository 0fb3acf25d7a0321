//! Bucket operations over the native S3 API, shared by the S3 and Storj backends.

use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as AwsDateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::{StreamExt, TryStreamExt, stream};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::storage::backend::{BodyStream, Download, StorageResult};
use crate::storage::error::StorageError;
use crate::storage::range::Range;

/// Smallest part S3 accepts, except for the last one.
pub(crate) const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts a single multipart upload may have.
const MAX_PARTS: u64 = 10_000;

/// Connection parameters for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint<'a> {
    pub region: &'a str,
    pub url: Option<&'a str>,
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub force_path_style: bool,
}

/// Headers attached to an object when it is written.
#[derive(Debug, Clone, Default)]
pub(crate) struct ObjectHeaders {
    pub content_type: String,
    pub metadata: HashMap<String, String>,
    pub expires: Option<DateTime<Utc>>,
}

/// Result of a HEAD request.
#[derive(Debug, Clone)]
pub(crate) struct ObjectHead {
    pub content_length: u64,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub expires: Option<DateTime<Utc>>,
}

/// A bucket reached through an SDK client.
#[derive(Debug, Clone)]
pub(crate) struct BucketClient {
    client: Client,
    bucket: String,
    backend: &'static str,
    concurrency: usize,
}

impl BucketClient {
    /// Build an SDK client with static credentials.
    pub(crate) async fn connect(
        endpoint: &Endpoint<'_>,
        bucket: &str,
        backend: &'static str,
        concurrency: usize,
    ) -> Self {
        let credentials = Credentials::new(
            endpoint.access_key_id,
            endpoint.secret_access_key,
            None,
            None,
            "transfer",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(endpoint.region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(endpoint.force_path_style);
        if let Some(url) = endpoint.url {
            config = config.endpoint_url(url);
        }

        Self {
            client: Client::from_conf(config.build()),
            bucket: bucket.to_string(),
            backend,
            concurrency: concurrency.max(1),
        }
    }

    pub(crate) fn bucket(&self) -> &str {
        &self.bucket
    }

    fn map_err<E>(&self, key: &str, err: &SdkError<E, HttpResponse>) -> StorageError
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
    {
        if is_not_found(err) {
            return StorageError::not_found(key);
        }
        StorageError::provider(self.backend, DisplayErrorContext(err).to_string())
    }

    pub(crate) async fn head(&self, key: &str) -> StorageResult<ObjectHead> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;

        Ok(ObjectHead {
            content_length: out
                .content_length()
                .and_then(|len| u64::try_from(len).ok())
                .unwrap_or_default(),
            content_type: out.content_type().map(String::from),
            metadata: out.metadata().cloned().unwrap_or_default(),
            expires: out.expires_string().and_then(parse_http_date),
        })
    }

    pub(crate) async fn get(&self, key: &str, range: Option<Range>) -> StorageResult<Download> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(range) = range {
            req = req.range(range.to_string());
        }

        let out = match req.send().await {
            Ok(out) => out,
            Err(err) if range.is_some() && err.code() == Some("InvalidRange") => {
                return Ok(Download {
                    body: stream::empty().boxed(),
                    content_length: 0,
                    content_range: None,
                });
            }
            Err(err) => return Err(self.map_err(key, &err)),
        };

        let returned = out
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or_default();
        let (content_length, content_range) = match range {
            Some(range) => {
                let total = out
                    .content_range()
                    .and_then(total_from_content_range)
                    .unwrap_or(range.start + returned);
                let length = range.accept_length(total);
                (length, range.content_range(length, total))
            }
            None => (returned, None),
        };

        let reader = out.body.into_async_read().take(content_length);
        Ok(Download {
            body: ReaderStream::new(reader).boxed(),
            content_length,
            content_range,
        })
    }

    pub(crate) async fn read_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        let data = out
            .body
            .collect()
            .await
            .map_err(|e| StorageError::provider(self.backend, e.to_string()))?;
        Ok(data.into_bytes())
    }

    pub(crate) async fn put_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        let len = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(i64::try_from(len).unwrap_or(i64::MAX))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        Ok(())
    }

    /// Upload exactly `content_length` bytes from `body`.
    ///
    /// Bodies that fit in one part go up in a single request; larger ones use a
    /// multipart upload with up to `concurrency` parts in flight, aborted on failure.
    pub(crate) async fn upload(
        &self,
        key: &str,
        body: BodyStream,
        content_length: u64,
        headers: &ObjectHeaders,
    ) -> StorageResult<()> {
        let part_size = part_size_for(content_length);
        let mut parts = PartReader::new(body);

        if content_length <= part_size {
            let data = parts.next_part(part_size + 1).await?.unwrap_or_default();
            let actual = data.len() as u64 + parts.drain().await?;
            if actual != content_length {
                return Err(StorageError::LengthMismatch {
                    key: key.to_string(),
                    expected: content_length,
                    actual,
                });
            }
            return self.put_single(key, data, headers).await;
        }

        let upload_id = self.create_multipart(key, headers).await?;
        match self
            .upload_parts(key, &upload_id, &mut parts, content_length, part_size)
            .await
        {
            Ok(completed) => {
                if let Err(err) = self.complete_multipart(key, &upload_id, completed).await {
                    self.abort_multipart(key, &upload_id).await;
                    return Err(err);
                }
                debug!(backend = self.backend, key, bytes = content_length, "Multipart upload completed");
                Ok(())
            }
            Err(err) => {
                self.abort_multipart(key, &upload_id).await;
                Err(err)
            }
        }
    }

    async fn put_single(&self, key: &str, data: Bytes, headers: &ObjectHeaders) -> StorageResult<()> {
        let len = data.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&headers.content_type)
            .content_length(i64::try_from(len).unwrap_or(i64::MAX))
            .set_metadata(Some(headers.metadata.clone()))
            .set_expires(headers.expires.map(to_aws_date))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        debug!(backend = self.backend, key, bytes = len, "Object uploaded");
        Ok(())
    }

    async fn create_multipart(&self, key: &str, headers: &ObjectHeaders) -> StorageResult<String> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&headers.content_type)
            .set_metadata(Some(headers.metadata.clone()))
            .set_expires(headers.expires.map(to_aws_date))
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;

        out.upload_id()
            .map(String::from)
            .ok_or_else(|| StorageError::provider(self.backend, "no upload id returned"))
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        parts: &mut PartReader,
        content_length: u64,
        part_size: u64,
    ) -> StorageResult<Vec<CompletedPart>> {
        let mut in_flight = FuturesUnordered::new();
        let mut completed = Vec::new();
        let mut received = 0u64;
        let mut part_number = 0i32;

        while let Some(chunk) = parts.next_part(part_size).await? {
            received += chunk.len() as u64;
            if received > content_length {
                break;
            }
            part_number += 1;
            in_flight.push(self.upload_part(key, upload_id, part_number, chunk));
            if in_flight.len() >= self.concurrency {
                if let Some(part) = in_flight.try_next().await? {
                    completed.push(part);
                }
            }
        }
        while let Some(part) = in_flight.try_next().await? {
            completed.push(part);
        }

        if received != content_length {
            return Err(StorageError::LengthMismatch {
                key: key.to_string(),
                expected: content_length,
                actual: received + parts.drain().await?,
            });
        }

        completed.sort_by_key(|part| part.part_number());
        Ok(completed)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        chunk: Bytes,
    ) -> StorageResult<CompletedPart> {
        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;

        Ok(CompletedPart::builder()
            .set_e_tag(out.e_tag().map(String::from))
            .part_number(part_number)
            .build())
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> StorageResult<()> {
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(err) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(backend = self.backend, key, upload_id, error = %DisplayErrorContext(&err), "Failed to abort multipart upload");
        }
    }

    /// Replace the headers of an existing object without re-uploading it.
    pub(crate) async fn rewrite_headers(&self, key: &str, headers: &ObjectHeaders) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(key)
            .copy_source(copy_source(&self.bucket, key))
            .metadata_directive(MetadataDirective::Replace)
            .content_type(&headers.content_type)
            .set_metadata(Some(headers.metadata.clone()))
            .set_expires(headers.expires.map(to_aws_date))
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        Ok(())
    }

    pub(crate) async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.map_err(key, &e))?;
        Ok(())
    }

    /// Create the bucket unless it already exists.
    pub(crate) async fn ensure_bucket(&self) -> StorageResult<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) if is_not_found(&err) => {}
            Err(err) => return Err(self.map_err(&self.bucket, &err)),
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                debug!(backend = self.backend, bucket = %self.bucket, "Bucket created");
                Ok(())
            }
            Err(err)
                if matches!(
                    err.code(),
                    Some("BucketAlreadyOwnedByYou" | "BucketAlreadyExists")
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(self.map_err(&self.bucket, &err)),
        }
    }
}

fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool
where
    E: ProvideErrorMetadata,
{
    matches!(err.code(), Some("NoSuchKey" | "NotFound" | "NoSuchBucket"))
        || err
            .raw_response()
            .is_some_and(|resp| resp.status().as_u16() == 404)
}

fn to_aws_date(date: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_secs(date.timestamp())
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Total object size from a `Content-Range: bytes s-e/total` response header.
pub(crate) fn total_from_content_range(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// `CopySource` value: bucket and URL-encoded key segments.
fn copy_source(bucket: &str, key: &str) -> String {
    let key = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{bucket}/{key}")
}

/// Part size keeping a `content_length` upload within the part count limit.
pub(crate) fn part_size_for(content_length: u64) -> u64 {
    MIN_PART_SIZE.max(content_length.div_ceil(MAX_PARTS))
}

/// Re-chunks a body stream into parts of a fixed size.
pub(crate) struct PartReader {
    body: BodyStream,
    pending: BytesMut,
    done: bool,
}

impl PartReader {
    pub(crate) fn new(body: BodyStream) -> Self {
        Self {
            body,
            pending: BytesMut::new(),
            done: false,
        }
    }

    /// Next part of exactly `size` bytes, shorter only at the end of the body.
    pub(crate) async fn next_part(&mut self, size: u64) -> std::io::Result<Option<Bytes>> {
        let size = usize::try_from(size).unwrap_or(usize::MAX);
        while !self.done && self.pending.len() < size {
            match self.body.try_next().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => self.done = true,
            }
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = size.min(self.pending.len());
        Ok(Some(self.pending.split_to(take).freeze()))
    }

    /// Consume the rest of the body, returning how many bytes were left.
    pub(crate) async fn drain(&mut self) -> std::io::Result<u64> {
        let mut left = self.pending.len() as u64;
        self.pending.clear();
        while !self.done {
            match self.body.try_next().await? {
                Some(chunk) => left += chunk.len() as u64,
                None => self.done = true,
            }
        }
        Ok(left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_bucket(server: &MockServer) -> BucketClient {
        let uri = server.uri();
        let endpoint = Endpoint {
            region: "us-east-1",
            url: Some(&uri),
            access_key_id: "key",
            secret_access_key: "secret",
            force_path_style: true,
        };
        BucketClient::connect(&endpoint, "uploads", "s3", 1).await
    }

    fn s3_error(status: u16, code: &str) -> ResponseTemplate {
        ResponseTemplate::new(status)
            .insert_header("content-type", "application/xml")
            .set_body_string(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{code}</Code><Message>{code}</Message></Error>"
            ))
    }

    fn body(chunks: &[&'static [u8]]) -> BodyStream {
        let items: Vec<std::io::Result<Bytes>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c)))
            .collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_part_reader_rechunks() {
        let mut reader = PartReader::new(body(&[b"abc", b"defgh", b"ij"]));
        assert_eq!(reader.next_part(4).await.unwrap().unwrap(), "abcd");
        assert_eq!(reader.next_part(4).await.unwrap().unwrap(), "efgh");
        assert_eq!(reader.next_part(4).await.unwrap().unwrap(), "ij");
        assert!(reader.next_part(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_part_reader_drain_counts_remainder() {
        let mut reader = PartReader::new(body(&[b"abc", b"defgh", b"ij"]));
        reader.next_part(2).await.unwrap();
        assert_eq!(reader.drain().await.unwrap(), 8);
        assert!(reader.next_part(2).await.unwrap().is_none());
    }

    #[rstest]
    #[case(0, MIN_PART_SIZE)]
    #[case(MIN_PART_SIZE * 3, MIN_PART_SIZE)]
    #[case(MIN_PART_SIZE * MAX_PARTS * 2, MIN_PART_SIZE * 2)]
    fn test_part_size_for(#[case] length: u64, #[case] expected: u64) {
        assert_eq!(part_size_for(length), expected);
    }

    #[rstest]
    #[case("bytes 0-499/1234", Some(1234))]
    #[case("bytes 1000-1499/24000", Some(24_000))]
    #[case("bytes */1234", Some(1234))]
    #[case("bytes 0-1/*", None)]
    #[case("garbage", None)]
    fn test_total_from_content_range(#[case] header: &str, #[case] expected: Option<u64>) {
        assert_eq!(total_from_content_range(header), expected);
    }

    #[test]
    fn test_copy_source_encodes_segments() {
        assert_eq!(
            copy_source("uploads", "abc/my report.pdf"),
            "uploads/abc/my%20report.pdf"
        );
    }

    #[test]
    fn test_parse_http_date() {
        let date = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").unwrap();
        assert_eq!(date.timestamp(), 1_445_412_480);
        assert!(parse_http_date("not a date").is_none());
    }

    #[tokio::test]
    async fn test_head_of_missing_key_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/uploads/tok/f.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let bucket = mock_bucket(&server).await;
        let err = bucket.head("tok/f.txt").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { ref key } if key == "tok/f.txt"));
    }

    #[tokio::test]
    async fn test_get_of_missing_key_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uploads/tok/f.txt"))
            .respond_with(s3_error(404, "NoSuchKey"))
            .mount(&server)
            .await;

        let bucket = mock_bucket(&server).await;
        let Err(err) = bucket.get("tok/f.txt", None).await else {
            panic!("expected not found");
        };
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_access_denied_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uploads/tok/f.txt"))
            .respond_with(s3_error(403, "AccessDenied"))
            .mount(&server)
            .await;

        let bucket = mock_bucket(&server).await;
        let Err(err) = bucket.get("tok/f.txt", None).await else {
            panic!("expected provider error");
        };
        assert!(matches!(err, StorageError::Provider { backend: "s3", .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_ranged_get_reports_served_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/uploads/tok/f.txt"))
            .and(header("range", "bytes=2-5"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", "bytes 2-5/10")
                    .set_body_string("2345"),
            )
            .mount(&server)
            .await;

        let bucket = mock_bucket(&server).await;
        let download = bucket.get("tok/f.txt", Some(Range::new(2, 4))).await.unwrap();
        assert_eq!(download.content_length, 4);
        assert_eq!(download.content_range.as_deref(), Some("bytes 2-5/10"));
        let bytes: Vec<u8> = download
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap();
        assert_eq!(bytes, b"2345");
    }
}
