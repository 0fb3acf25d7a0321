//! Backend construction from [`StorageSettings`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use transfer_shared::StorageSettings;

use super::azure::AzureStorage;
use super::backend::{Storage, StorageResult};
use super::gdrive::{AuthorizationPrompt, GDriveOptions, GDriveStorage};
use super::local::LocalStorage;
use super::s3::{S3Options, S3Storage};
use super::storj::StorjStorage;
use super::webdav::WebDavStorage;

/// Runtime inputs a backend needs besides its settings.
#[derive(Clone, Default)]
pub struct BackendOptions {
    /// Native expiry for backends that support it (S3, Storj).
    pub retention: Option<Duration>,
    /// Consent flow for Google Drive when no token is cached.
    pub authorizer: Option<Arc<dyn AuthorizationPrompt>>,
}

impl std::fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOptions")
            .field("retention", &self.retention)
            .field("authorizer", &self.authorizer.is_some())
            .finish()
    }
}

impl BackendOptions {
    /// Set the native expiry.
    #[must_use]
    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Set the Google Drive consent flow.
    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn AuthorizationPrompt>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }
}

/// Construct the backend selected by `settings`.
///
/// # Errors
///
/// Returns an error if the settings are invalid, credentials are rejected,
/// or the backend cannot be reached during setup.
pub async fn from_settings(
    settings: &StorageSettings,
    options: BackendOptions,
) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match settings {
        StorageSettings::Local { basedir } => Arc::new(LocalStorage::new(basedir).await?),
        StorageSettings::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            force_path_style,
            disable_multipart,
        } => Arc::new(
            S3Storage::new(S3Options {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
                force_path_style: *force_path_style,
                disable_multipart: *disable_multipart,
                retention: options.retention,
            })
            .await?,
        ),
        StorageSettings::Azure {
            account,
            container,
            access_key,
        } => Arc::new(AzureStorage::new(account, container, access_key.as_deref())?),
        StorageSettings::Gdrive {
            client_secret_path,
            local_config_path,
            basedir,
            chunk_size_mb,
        } => Arc::new(
            GDriveStorage::new(
                GDriveOptions {
                    client_secret_path: client_secret_path.clone(),
                    local_config_path: local_config_path.clone(),
                    basedir: basedir.clone(),
                    chunk_size_mb: *chunk_size_mb,
                },
                options.authorizer,
            )
            .await?,
        ),
        StorageSettings::Storj {
            access_grant,
            bucket,
            auth_service_url,
        } => Arc::new(
            StorjStorage::new(access_grant, bucket, auth_service_url, options.retention).await?,
        ),
        StorageSettings::Webdav {
            url,
            base_path,
            username,
            password,
        } => Arc::new(WebDavStorage::connect(url, base_path, username, password).await?),
    };

    info!(provider = settings.name(), kind = %storage.kind(), "Storage backend initialized");
    Ok(storage)
}
