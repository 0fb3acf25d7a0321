//! Local filesystem backend.
//!
//! Each token is a directory under the base directory, each file a plain file in it.
//! Writes land in `.tmp` first and are renamed into place, so a reader never
//! sees a half-written file or sidecar.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use opendal::{Operator, services};
use tracing::info;

use super::backend::{BodyStream, Download, Storage, StorageKind, StorageResult};
use super::error::StorageError;
use super::metadata::Metadata;
use super::operator::OperatorStore;
use super::range::Range;

/// Staging directory for in-progress writes, under the base directory.
pub const STAGING_DIR: &str = ".tmp";

/// Files under a base directory.
#[derive(Debug)]
pub struct LocalStorage {
    basedir: PathBuf,
    store: OperatorStore,
}

impl LocalStorage {
    /// Open storage rooted at `basedir`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is not valid UTF-8.
    pub async fn new(basedir: impl AsRef<Path>) -> StorageResult<Self> {
        let basedir = basedir.as_ref().to_path_buf();
        let staging = basedir.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let root = basedir
            .to_str()
            .ok_or_else(|| StorageError::configuration("invalid path"))?;
        let staging = staging
            .to_str()
            .ok_or_else(|| StorageError::configuration("invalid path"))?;
        let op = Operator::new(services::Fs::default().root(root).atomic_write_dir(staging))
            .map_err(|e| StorageError::configuration(e.to_string()))?
            .finish();

        info!(basedir = %basedir.display(), "Local storage ready");
        Ok(Self {
            basedir,
            store: OperatorStore::new(op, StorageKind::Local, true),
        })
    }

    /// The base directory.
    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Local
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<u64> {
        self.store.head(token, filename).await
    }

    async fn get(
        &self,
        token: &str,
        filename: &str,
        range: Option<Range>,
    ) -> StorageResult<Download> {
        self.store.get(token, filename, range).await
    }

    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: BodyStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        self.store
            .put(token, filename, body, content_type, content_length)
            .await
    }

    async fn metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        self.store.read_metadata(token, filename).await
    }

    async fn meta(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        self.store.meta(token, filename, metadata).await
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        self.store.delete(token, filename).await
    }

    async fn purge(&self, max_age: Duration) -> StorageResult<()> {
        self.store.sweep(max_age).await.map(|_| ())
    }
}
