//! Azure Blob Storage backend.
//!
//! One provider container holds every upload as a `token/filename` blob.
//! Credentials are resolved once at construction: the shared key when given,
//! otherwise the environment (`AZURE_STORAGE_*`, workload identity).

use std::time::Duration;

use async_trait::async_trait;
use opendal::{Operator, services};
use tracing::info;

use super::backend::{BodyStream, Download, Storage, StorageKind, StorageResult};
use super::error::StorageError;
use super::metadata::Metadata;
use super::operator::OperatorStore;
use super::range::Range;

/// Blobs in an Azure storage container.
#[derive(Debug)]
pub struct AzureStorage {
    container: String,
    store: OperatorStore,
}

/// Public blob endpoint of a storage account.
fn account_endpoint(account: &str) -> String {
    format!("https://{account}.blob.core.windows.net")
}

impl AzureStorage {
    /// Connect to `container` in `account`.
    ///
    /// # Errors
    ///
    /// Returns an error if the OpenDAL operator cannot be built.
    pub fn new(account: &str, container: &str, access_key: Option<&str>) -> StorageResult<Self> {
        if account.is_empty() || container.is_empty() {
            return Err(StorageError::configuration(
                "azure account and container are required",
            ));
        }

        let mut builder = services::Azblob::default()
            .endpoint(&account_endpoint(account))
            .account_name(account)
            .container(container);
        if let Some(key) = access_key {
            builder = builder.account_key(key);
        }

        let op = Operator::new(builder)
            .map_err(|e| StorageError::configuration(e.to_string()))?
            .finish();

        info!(account, container, "Azure storage ready");
        Ok(Self {
            container: container.to_string(),
            store: OperatorStore::new(op, StorageKind::Azure, false),
        })
    }

    /// The blob container name.
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }
}

#[async_trait]
impl Storage for AzureStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::Azure
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
