//! Object access shared by the OpenDAL-backed stores (local, Azure, WebDAV).
//!
//! Objects live at `token/filename`; their [`Metadata`] is kept as JSON in a
//! `token/filename.metadata` sidecar next to them.

use std::time::{Duration, SystemTime};

use futures::{StreamExt, TryStreamExt, stream};
use opendal::{Operator, Writer};
use tracing::{debug, info, warn};

use super::backend::{BodyStream, Download, StorageKind, StorageResult, metadata_key, object_key};
use super::error::StorageError;
use super::metadata::Metadata;
use super::range::Range;

const METADATA_SUFFIX: &str = ".metadata";

/// Sidecar-metadata object store over an OpenDAL operator.
#[derive(Debug, Clone)]
pub(crate) struct OperatorStore {
    op: Operator,
    kind: StorageKind,
    create_dirs: bool,
}

impl OperatorStore {
    /// Wrap `op`. With `create_dirs`, the token directory is created before writes.
    pub(crate) fn new(op: Operator, kind: StorageKind, create_dirs: bool) -> Self {
        Self {
            op,
            kind,
            create_dirs,
        }
    }

    fn map_err(&self, key: &str, err: &opendal::Error) -> StorageError {
        StorageError::from_opendal(self.kind.as_str(), key, err)
    }

    pub(crate) async fn head(&self, token: &str, filename: &str) -> StorageResult<u64> {
        let key = object_key(token, filename);
        let meta = self.op.stat(&key).await.map_err(|e| self.map_err(&key, &e))?;
        if meta.is_dir() {
            return Err(StorageError::not_found(key));
        }
        Ok(meta.content_length())
    }

    pub(crate) async fn get(
        &self,
        token: &str,
        filename: &str,
        range: Option<Range>,
    ) -> StorageResult<Download> {
        let key = object_key(token, filename);
        let total = self.head(token, filename).await?;

        let (start, content_length, content_range) = match range {
            Some(range) => {
                let length = range.accept_length(total);
                (range.start, length, range.content_range(length, total))
            }
            None => (0, total, None),
        };

        if content_length == 0 {
            return Ok(Download {
                body: stream::empty().boxed(),
                content_length,
                content_range,
            });
        }

        let reader = self.op.reader(&key).await.map_err(|e| self.map_err(&key, &e))?;
        let body = reader
            .into_bytes_stream(start..start + content_length)
            .await
            .map_err(|e| self.map_err(&key, &e))?;

        debug!(backend = %self.kind, key, bytes = content_length, "Streaming object");
        Ok(Download {
            body: body.boxed(),
            content_length,
            content_range,
        })
    }

    pub(crate) async fn put(
        &self,
        token: &str,
        filename: &str,
        body: BodyStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        let key = object_key(token, filename);

        if self.create_dirs {
            self.op
                .create_dir(&format!("{token}/"))
                .await
                .map_err(|e| self.map_err(&key, &e))?;
        }

        let writer = if self.op.info().full_capability().write_with_content_type {
            self.op.writer_with(&key).content_type(content_type).await
        } else {
            self.op.writer(&key).await
        };
        let mut writer = writer.map_err(|e| self.map_err(&key, &e))?;

        let outcome = match copy_body(&mut writer, body, content_length).await {
            Ok(written) if written == content_length => writer
                .close()
                .await
                .map(|_| ())
                .map_err(|e| self.map_err(&key, &e)),
            Ok(actual) => Err(StorageError::LengthMismatch {
                key: key.clone(),
                expected: content_length,
                actual,
            }),
            Err(err) => Err(err),
        };

        if let Err(err) = outcome {
            if let Err(abort) = writer.abort().await {
                debug!(backend = %self.kind, key, error = %abort, "Writer abort failed");
            }
            self.discard(token, filename).await;
            return Err(err);
        }

        let metadata = Metadata::new(content_type, content_length);
        if let Err(err) = self.write_metadata(token, filename, &metadata).await {
            self.discard(token, filename).await;
            return Err(err);
        }

        debug!(backend = %self.kind, key, bytes = content_length, "Stored object");
        Ok(())
    }

    pub(crate) async fn read_metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        let sidecar = metadata_key(token, filename);

        // A sidecar without its object is never served.
        self.head(token, filename).await?;
        match self.op.read(&sidecar).await {
            Ok(buf) => Metadata::from_json(&key, &buf.to_bytes()),
            Err(err) if err.kind() == opendal::ErrorKind::NotFound => {
                Err(StorageError::integrity(key, "metadata sidecar missing"))
            }
            Err(err) => Err(self.map_err(&sidecar, &err)),
        }
    }

    pub(crate) async fn write_metadata(
        &self,
        token: &str,
        filename: &str,
        metadata: &Metadata,
    ) -> StorageResult<()> {
        let sidecar = metadata_key(token, filename);
        let raw = metadata.to_json()?;
        self.op
            .write(&sidecar, raw)
            .await
            .map(|_| ())
            .map_err(|e| self.map_err(&sidecar, &e))
    }

    /// Rewrite the sidecar of an existing object.
    pub(crate) async fn meta(
        &self,
        token: &str,
        filename: &str,
        metadata: &Metadata,
    ) -> StorageResult<()> {
        self.head(token, filename).await?;
        self.write_metadata(token, filename, metadata).await
    }

    pub(crate) async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        let key = object_key(token, filename);
        let sidecar = metadata_key(token, filename);

        if let Err(err) = self.op.delete(&sidecar).await {
            if err.kind() != opendal::ErrorKind::NotFound {
                warn!(backend = %self.kind, key = sidecar, error = %err, "Failed to delete metadata");
            }
        }

        self.head(token, filename).await?;
        self.op
            .delete(&key)
            .await
            .map_err(|e| self.map_err(&key, &e))?;
        debug!(backend = %self.kind, key, "Deleted object");
        Ok(())
    }

    /// Delete every file last modified more than `max_age` ago.
    ///
    /// Returns the number of files removed.
    pub(crate) async fn sweep(&self, max_age: Duration) -> StorageResult<usize> {
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(0);
        };

        let mut lister = self
            .op
            .lister_with("/")
            .recursive(true)
            .await
            .map_err(|e| self.map_err("/", &e))?;

        let mut removed = 0;
        while let Some(entry) = lister.try_next().await.map_err(|e| self.map_err("/", &e))? {
            let path = entry.path();
            if entry.metadata().is_dir() {
                continue;
            }

            let modified = match entry.metadata().last_modified() {
                Some(ts) => Some(SystemTime::from(ts)),
                None => match self.op.stat(path).await {
                    Ok(meta) => meta.last_modified().map(SystemTime::from),
                    Err(err) => {
                        warn!(backend = %self.kind, path, error = %err, "Failed to stat during purge");
                        None
                    }
                },
            };
            if !modified.is_some_and(|m| m < cutoff) {
                continue;
            }

            match self.op.delete(path).await {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(backend = %self.kind, path, error = %err, "Failed to purge object");
                    continue;
                }
            }
            if !path.ends_with(METADATA_SUFFIX) {
                let sidecar = format!("{path}{METADATA_SUFFIX}");
                if let Err(err) = self.op.delete(&sidecar).await {
                    debug!(backend = %self.kind, path = sidecar, error = %err, "Sidecar already gone");
                }
            }
        }

        info!(backend = %self.kind, removed, "Purge finished");
        Ok(removed)
    }

    /// Remove the object and its sidecar after a failed upload.
    async fn discard(&self, token: &str, filename: &str) {
        for key in [object_key(token, filename), metadata_key(token, filename)] {
            match self.op.delete(&key).await {
                Ok(()) => {}
                Err(err) if err.kind() == opendal::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(backend = %self.kind, key, error = %err, "Failed to remove partial upload");
                }
            }
        }
    }
}

/// Copy `body` into `writer`, stopping once more than `limit` bytes arrived.
///
/// Returns the number of bytes received.
async fn copy_body(writer: &mut Writer, mut body: BodyStream, limit: u64) -> StorageResult<u64> {
    let mut written = 0u64;
    while let Some(chunk) = body.try_next().await? {
        written += chunk.len() as u64;
        if written > limit {
            return Ok(written);
        }
        writer
            .write(chunk)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
    }
    Ok(written)
}
