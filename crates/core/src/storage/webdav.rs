//! WebDAV backend.
//!
//! Tokens are collections under `base_path`; server-side 404s on any verb
//! surface as not-found through OpenDAL's error kinds.

use std::time::Duration;

use async_trait::async_trait;
use opendal::{Operator, services};
use tracing::info;

use super::backend::{BodyStream, Download, Storage, StorageKind, StorageResult};
use super::error::StorageError;
use super::metadata::Metadata;
use super::operator::OperatorStore;
use super::range::Range;

/// Files on a WebDAV server.
#[derive(Debug)]
pub struct WebDavStorage {
    op: Operator,
    store: OperatorStore,
}

/// Normalize a configured base path to OpenDAL's absolute root form.
fn root_path(base_path: &str) -> String {
    let trimmed = base_path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

impl WebDavStorage {
    /// Build a client for `url` rooted at `base_path` without contacting the server.
    ///
    /// # Errors
    ///
    /// Returns an error if the OpenDAL operator cannot be built.
    pub fn new(url: &str, base_path: &str, username: &str, password: &str) -> StorageResult<Self> {
        let mut builder = services::Webdav::default()
            .endpoint(url)
            .root(&root_path(base_path));
        if !username.is_empty() {
            builder = builder.username(username).password(password);
        }

        let op = Operator::new(builder)
            .map_err(|e| StorageError::configuration(e.to_string()))?
            .finish();

        Ok(Self {
            store: OperatorStore::new(op.clone(), StorageKind::WebDav, true),
            op,
        })
    }

    /// Build a client and verify the server answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or rejects the credentials.
    pub async fn connect(
        url: &str,
        base_path: &str,
        username: &str,
        password: &str,
    ) -> StorageResult<Self> {
        let storage = Self::new(url, base_path, username, password)?;
        storage
            .op
            .check()
            .await
            .map_err(|e| StorageError::provider(StorageKind::WebDav.as_str(), e.to_string()))?;
        info!(url, base_path, "WebDAV storage ready");
        Ok(storage)
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::WebDav
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

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "/")]
    #[case("/", "/")]
    #[case("uploads", "/uploads/")]
    #[case("/srv/uploads/", "/srv/uploads/")]
    fn test_root_path(#[case] base_path: &str, #[case] expected: &str) {
        assert_eq!(root_path(base_path), expected);
    }

    #[test]
    fn test_new_is_offline() {
        let storage = WebDavStorage::new("http://127.0.0.1:1", "uploads", "user", "pass").unwrap();
        assert_eq!(storage.kind(), StorageKind::WebDav);
    }
}
