//! Download accounting.
//!
//! Reading the counter, checking the limits and writing the incremented value
//! back is a read-modify-write against the backend. Two downloads of the same
//! object racing through it would lose an increment, so every object gets an
//! async mutex for the duration of the update. The lock is process-local: it
//! serializes downloads served by this process only.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use super::backend::{Storage, StorageResult, object_key};
use super::metadata::Metadata;

/// Serializes metadata updates per object.
pub struct DownloadLedger {
    storage: Arc<dyn Storage>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DownloadLedger {
    /// Create a ledger over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
        }
    }

    /// The wrapped storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Check limits without counting a download.
    pub async fn check_available(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        let metadata = self.storage.metadata(token, filename).await?;
        metadata.check_available(&key, Utc::now())?;
        Ok(metadata)
    }

    /// Check limits and count one download.
    ///
    /// Returns the metadata as stored after the increment.
    pub async fn record_download(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        let lock = self.lock_for(&key);

        let result = {
            let _guard = lock.lock().await;
            self.increment(&key, token, filename).await
        };

        drop(lock);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn increment(&self, key: &str, token: &str, filename: &str) -> StorageResult<Metadata> {
        let mut metadata = self.storage.metadata(token, filename).await?;
        metadata.check_available(key, Utc::now())?;
        metadata.downloads = metadata.downloads.saturating_add(1);
        self.storage.meta(token, filename, &metadata).await?;
        debug!(key, downloads = metadata.downloads, "Recorded download");
        Ok(metadata)
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of objects with an update in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}
