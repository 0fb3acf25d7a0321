//! The storage contract shared by every backend.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};

use super::error::StorageError;
use super::metadata::Metadata;
use super::range::Range;

/// Byte stream used for upload bodies and download results.
///
/// Dropping the stream releases the underlying provider connection or file handle.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Identifies a backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Local filesystem.
    Local,
    /// S3-compatible object storage.
    S3,
    /// Azure Blob Storage.
    Azure,
    /// Google Drive.
    GDrive,
    /// Storj.
    Storj,
    /// WebDAV.
    WebDav,
}

impl StorageKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
            Self::Azure => "azure",
            Self::GDrive => "gdrive",
            Self::Storj => "storj",
            Self::WebDav => "webdav",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download in progress.
pub struct Download {
    /// Object bytes, limited to the accepted range when one was requested.
    pub body: BodyStream,
    /// Number of bytes `body` yields.
    pub content_length: u64,
    /// `Content-Range` value when a range was accepted.
    pub content_range: Option<String>,
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Object key `token/filename`.
#[must_use]
pub fn object_key(token: &str, filename: &str) -> String {
    format!("{token}/{filename}")
}

/// Sidecar metadata key `token/filename.metadata`.
#[must_use]
pub fn metadata_key(token: &str, filename: &str) -> String {
    format!("{token}/{filename}.metadata")
}

/// Operations every storage backend provides.
///
/// Objects are addressed by `(token, filename)`. Backends are constructed once
/// and shared as `Arc<dyn Storage>` between request handlers and the purge job.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend identifier.
    fn kind(&self) -> StorageKind;

    /// Content length of a stored object.
    async fn head(&self, token: &str, filename: &str) -> StorageResult<u64>;

    /// Stream a stored object, optionally limited to `range`.
    ///
    /// With a range, the returned length is `range.accept_length(total)`.
    async fn get(
        &self,
        token: &str,
        filename: &str,
        range: Option<Range>,
    ) -> StorageResult<Download>;

    /// Store exactly `content_length` bytes read from `body`.
    ///
    /// On failure nothing readable is left under `(token, filename)`.
    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: BodyStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()>;

    /// Read the metadata record of a stored object.
    async fn metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata>;

    /// Rewrite the metadata record without re-uploading the body.
    async fn meta(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()>;

    /// Remove an object together with its metadata.
    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()>;

    /// Remove every object older than `max_age`.
    ///
    /// Backends with provider-native expiry implement this as a no-op.
    async fn purge(&self, max_age: Duration) -> StorageResult<()>;

    /// Whether `err` means the object does not exist.
    fn is_not_exist(&self, err: &StorageError) -> bool {
        err.is_not_found()
    }

    /// Whether `get` honors ranges.
    fn is_range_supported(&self) -> bool {
        true
    }
}

/// Truncate `body` after `len` bytes.
pub(crate) fn limit_body(body: BodyStream, len: u64) -> BodyStream {
    ReaderStream::new(StreamReader::new(body).take(len)).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{TryStreamExt, stream};
    use rstest::rstest;

    async fn drain(body: BodyStream) -> Vec<u8> {
        body.try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    #[rstest]
    #[case(4, b"abcd".as_slice())]
    #[case(6, b"abcdef".as_slice())]
    #[case(100, b"abcdefghij".as_slice())]
    #[tokio::test]
    async fn test_limit_body(#[case] len: u64, #[case] expected: &[u8]) {
        let chunks = vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
            Ok(Bytes::from_static(b"ghij")),
        ];
        let body = limit_body(stream::iter(chunks).boxed(), len);
        assert_eq!(drain(body).await, expected);
    }

    #[rstest]
    #[case(StorageKind::Local, "local")]
    #[case(StorageKind::S3, "s3")]
    #[case(StorageKind::Azure, "azure")]
    #[case(StorageKind::GDrive, "gdrive")]
    #[case(StorageKind::Storj, "storj")]
    #[case(StorageKind::WebDav, "webdav")]
    fn test_kind_names(#[case] kind: StorageKind, #[case] expected: &str) {
        assert_eq!(kind.as_str(), expected);
        assert_eq!(kind.to_string(), expected);
    }

    #[test]
    fn test_keys() {
        assert_eq!(object_key("abc123", "report.pdf"), "abc123/report.pdf");
        assert_eq!(
            metadata_key("abc123", "report.pdf"),
            "abc123/report.pdf.metadata"
        );
    }
}
