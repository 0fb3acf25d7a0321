//! Google Drive backend.
//!
//! Drive has no key hierarchy, so the directory layout of the local backend is
//! emulated with folders: a root folder (its ID cached in `root_id.conf`), one
//! child folder per token, and the uploaded files inside it. Metadata is kept
//! in each file's custom `properties`.

mod api;
mod auth;

pub use auth::AuthorizationPrompt;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use tracing::{debug, info, warn};

use api::{DriveClient, FOLDER_MIME_TYPE, chunk_size_bytes, escape_query};
use auth::{ClientSecret, TokenSource};

use super::backend::{
    BodyStream, Download, Storage, StorageKind, StorageResult, limit_body, object_key,
};
use super::error::StorageError;
use super::metadata::{Metadata, PROP_MAX_DATE};
use super::range::Range;

/// File caching the root folder ID.
pub const ROOT_ID_FILE: &str = "root_id.conf";
/// File caching the OAuth token.
pub const TOKEN_FILE: &str = "token.json";

const METADATA_SUFFIX: &str = ".metadata";

/// Construction parameters of [`GDriveStorage`].
#[derive(Debug, Clone)]
pub struct GDriveOptions {
    /// OAuth client secret JSON.
    pub client_secret_path: PathBuf,
    /// Directory for the root ID and token caches.
    pub local_config_path: PathBuf,
    /// Name of the root folder.
    pub basedir: String,
    /// Upload chunk size in MiB.
    pub chunk_size_mb: usize,
}

/// Files in Google Drive folders.
#[derive(Debug)]
pub struct GDriveStorage {
    api: DriveClient,
    root_id: String,
    chunk_size: u64,
}

impl GDriveStorage {
    /// Authenticate and locate (or create) the root folder.
    ///
    /// # Errors
    ///
    /// Returns `Unauthorized` when no token is cached and `prompt` is `None`
    /// or declines, and other errors when the secret or caches are unreadable.
    pub async fn new(
        options: GDriveOptions,
        prompt: Option<Arc<dyn AuthorizationPrompt>>,
    ) -> StorageResult<Self> {
        let raw = tokio::fs::read(&options.client_secret_path).await.map_err(|e| {
            StorageError::configuration(format!(
                "cannot read client secret {}: {e}",
                options.client_secret_path.display()
            ))
        })?;
        let secret = ClientSecret::from_json(&raw)?;

        let http = api::http_client()?;

        let tokens = TokenSource::load(
            http.clone(),
            secret,
            options.local_config_path.join(TOKEN_FILE),
            prompt.as_deref(),
        )
        .await?;
        let api = DriveClient::new(http, tokens);
        let root_id = setup_root(&api, &options).await?;

        info!(root = %root_id, basedir = %options.basedir, "Google Drive storage ready");
        Ok(Self {
            api,
            root_id,
            chunk_size: chunk_size_bytes(options.chunk_size_mb),
        })
    }

    async fn token_folder(&self, token: &str) -> StorageResult<Option<String>> {
        self.api.find_folder(&self.root_id, token).await
    }

    /// Drive ID of `token/filename`.
    async fn resolve(&self, token: &str, filename: &str) -> StorageResult<String> {
        let key = object_key(token, filename);
        let folder = self
            .token_folder(token)
            .await?
            .ok_or_else(|| StorageError::not_found(&key))?;
        self.api
            .find_file(&folder, filename)
            .await?
            .ok_or_else(|| StorageError::not_found(key))
    }
}

async fn setup_root(api: &DriveClient, options: &GDriveOptions) -> StorageResult<String> {
    let path = options.local_config_path.join(ROOT_ID_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let id = api.create_folder(None, &options.basedir).await?;
    tokio::fs::write(&path, &id).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(id)
}

/// Properties patch for `metadata`; an absent expiry clears a stale one.
fn properties_patch(metadata: &Metadata) -> HashMap<String, Option<String>> {
    let mut patch: HashMap<String, Option<String>> = metadata
        .to_properties()
        .into_iter()
        .map(|(k, v)| (k, Some(v)))
        .collect();
    patch.entry(PROP_MAX_DATE.to_string()).or_insert(None);
    patch
}

#[async_trait]
impl Storage for GDriveStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::GDrive
    }

    async fn head(&self, token: &str, filename: &str) -> StorageResult<u64> {
        let id = self.resolve(token, filename).await?;
        Ok(self.api.get_file(&id, "id,size").await?.size())
    }

    async fn get(
        &self,
        token: &str,
        filename: &str,
        range: Option<Range>,
    ) -> StorageResult<Download> {
        let key = object_key(token, filename);
        let id = self.resolve(token, filename).await?;
        let file = self.api.get_file(&id, "id,size,md5Checksum").await?;
        if file.md5_checksum.as_deref().is_none_or(str::is_empty) {
            // Checksum is computed server-side once the upload is fully processed.
            return Err(StorageError::not_found(key));
        }

        let total = file.size();
        let (content_length, content_range) = match range {
            Some(range) => {
                let length = range.accept_length(total);
                (length, range.content_range(length, total))
            }
            None => (total, None),
        };
        if content_length == 0 {
            return Ok(Download {
                body: stream::empty().boxed(),
                content_length,
                content_range,
            });
        }

        let body = limit_body(self.api.download(&id, range).await?, content_length);
        debug!(backend = "gdrive", key, bytes = content_length, "Streaming object");
        Ok(Download {
            body,
            content_length,
            content_range,
        })
    }

    async fn put(
        &self,
        token: &str,
        filename: &str,
        body: BodyStream,
        content_type: &str,
        content_length: u64,
    ) -> StorageResult<()> {
        let folder = match self.token_folder(token).await? {
            Some(id) => id,
            None => self.api.create_folder(Some(&self.root_id), token).await?,
        };

        let properties = Metadata::new(content_type, content_length).to_properties();
        let id = self
            .api
            .upload(
                &folder,
                filename,
                content_type,
                properties,
                body,
                content_length,
                self.chunk_size,
            )
            .await?;
        debug!(backend = "gdrive", token, filename, id = %id, bytes = content_length, "Stored object");
        Ok(())
    }

    async fn metadata(&self, token: &str, filename: &str) -> StorageResult<Metadata> {
        let key = object_key(token, filename);
        let id = self.resolve(token, filename).await?;
        let file = self.api.get_file(&id, "id,size,mimeType,properties").await?;
        let size = file.size();
        Metadata::from_properties(&key, &file.properties, file.mime_type, size)
    }

    async fn meta(&self, token: &str, filename: &str, metadata: &Metadata) -> StorageResult<()> {
        let id = self.resolve(token, filename).await?;
        self.api.update_properties(&id, &properties_patch(metadata)).await
    }

    async fn delete(&self, token: &str, filename: &str) -> StorageResult<()> {
        let sidecar = format!("{filename}{METADATA_SUFFIX}");
        match self.resolve(token, &sidecar).await {
            Ok(id) => {
                if let Err(err) = self.api.delete(&id).await {
                    warn!(backend = "gdrive", token, filename = %sidecar, error = %err, "Failed to delete metadata file");
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let id = self.resolve(token, filename).await?;
        self.api.delete(&id).await?;
        debug!(backend = "gdrive", token, filename, "Deleted object");
        Ok(())
    }

    async fn purge(&self, max_age: Duration) -> StorageResult<()> {
        let max_age = chrono::Duration::from_std(max_age)
            .map_err(|e| StorageError::configuration(e.to_string()))?;
        let cutoff = (Utc::now() - max_age).to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let folders = self
            .api
            .list(
                &format!(
                    "'{}' in parents and mimeType='{FOLDER_MIME_TYPE}' and trashed=false",
                    escape_query(&self.root_id)
                ),
                "id,name",
            )
            .await?;

        let mut removed = 0usize;
        for folder in folders {
            let query = format!(
                "'{}' in parents and mimeType!='{FOLDER_MIME_TYPE}' and modifiedTime < '{cutoff}' and trashed=false",
                escape_query(&folder.id)
            );
            for file in self.api.list(&query, "id,name,modifiedTime").await? {
                match self.api.delete(&file.id).await {
                    Ok(()) => {
                        debug!(backend = "gdrive", token = %folder.name, filename = %file.name, modified = ?file.modified_time, "Purged file");
                        removed += 1;
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        warn!(backend = "gdrive", token = %folder.name, filename = %file.name, error = %err, "Failed to purge file");
                    }
                }
            }
        }

        info!(backend = "gdrive", removed, "Purge finished");
        Ok(())
    }
}
