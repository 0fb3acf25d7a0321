//! Application configuration management.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    pub storage: StorageSettings,
    /// Purge and retention configuration.
    #[serde(default)]
    pub purge: PurgeConfig,
}

/// Storage backend selection and construction parameters.
///
/// Exactly one backend is active per process; it is chosen here and
/// constructed once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum StorageSettings {
    /// Local filesystem under a base directory.
    Local {
        /// Base directory holding one subdirectory per token.
        basedir: PathBuf,
    },
    /// S3-compatible object storage: AWS S3, MinIO, Cloudflare R2, DigitalOcean Spaces.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Region.
        region: String,
        /// Custom endpoint URL for S3-compatible providers.
        #[serde(default)]
        endpoint: Option<String>,
        /// Access key ID.
        access_key_id: String,
        /// Secret access key.
        secret_access_key: String,
        /// Use path-style addressing instead of virtual-hosted buckets.
        #[serde(default)]
        force_path_style: bool,
        /// Upload parts one at a time instead of concurrently.
        #[serde(default)]
        disable_multipart: bool,
    },
    /// Azure Blob Storage.
    Azure {
        /// Storage account name.
        account: String,
        /// Blob container name.
        container: String,
        /// Shared account key. Falls back to ambient credential discovery when absent.
        #[serde(default)]
        access_key: Option<String>,
    },
    /// Google Drive, emulating directories with folders.
    Gdrive {
        /// OAuth client secret JSON downloaded from the Google console.
        client_secret_path: PathBuf,
        /// Directory holding the root folder ID cache and the OAuth token cache.
        local_config_path: PathBuf,
        /// Name of the root folder created in the drive.
        basedir: String,
        /// Upload chunk size in MiB.
        #[serde(default = "default_chunk_size_mb")]
        chunk_size_mb: usize,
    },
    /// Storj decentralized storage.
    Storj {
        /// Serialized access grant.
        access_grant: String,
        /// Bucket name, created when absent.
        bucket: String,
        /// Auth service registering the access grant for gateway credentials.
        #[serde(default = "default_storj_auth_service")]
        auth_service_url: String,
    },
    /// WebDAV server.
    Webdav {
        /// Server URL.
        url: String,
        /// Directory on the server holding one subdirectory per token.
        #[serde(default)]
        base_path: String,
        /// Username.
        username: String,
        /// Password.
        password: String,
    },
}

fn default_chunk_size_mb() -> usize {
    16
}

fn default_storj_auth_service() -> String {
    "https://auth.storjshare.io".to_string()
}

impl StorageSettings {
    /// Create local filesystem settings.
    #[must_use]
    pub fn local(basedir: impl Into<PathBuf>) -> Self {
        Self::Local {
            basedir: basedir.into(),
        }
    }

    /// Create S3 settings with default addressing and multipart enabled.
    #[must_use]
    pub fn s3(
        bucket: impl Into<String>,
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self::S3 {
            bucket: bucket.into(),
            region: region.into(),
            endpoint: None,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            force_path_style: false,
            disable_multipart: false,
        }
    }

    /// Create Azure Blob Storage settings using ambient credentials.
    #[must_use]
    pub fn azure(account: impl Into<String>, container: impl Into<String>) -> Self {
        Self::Azure {
            account: account.into(),
            container: container.into(),
            access_key: None,
        }
    }

    /// Create WebDAV settings.
    #[must_use]
    pub fn webdav(
        url: impl Into<String>,
        base_path: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::Webdav {
            url: url.into(),
            base_path: base_path.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Get the provider name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::S3 { .. } => "s3",
            Self::Azure { .. } => "azure",
            Self::Gdrive { .. } => "gdrive",
            Self::Storj { .. } => "storj",
            Self::Webdav { .. } => "webdav",
        }
    }
}

/// Purge scheduling configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PurgeConfig {
    /// Uploads older than this many days are purged. `0` disables purging
    /// and native upload expiry.
    #[serde(default)]
    pub days: u64,
    /// Hours between two purge runs.
    #[serde(default = "default_purge_interval_hours")]
    pub interval_hours: u64,
}

fn default_purge_interval_hours() -> u64 {
    24
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            days: 0,
            interval_hours: default_purge_interval_hours(),
        }
    }
}

impl PurgeConfig {
    /// Seconds in one day.
    pub const SECS_PER_DAY: u64 = 86_400;

    /// Maximum upload age, or `None` when purging is disabled.
    #[must_use]
    pub fn max_age(&self) -> Option<std::time::Duration> {
        (self.days > 0)
            .then(|| std::time::Duration::from_secs(self.days.saturating_mul(Self::SECS_PER_DAY)))
    }

    /// Time between two purge runs. Never zero.
    #[must_use]
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_hours.max(1).saturating_mul(3600))
    }
}

impl AppConfig {
    /// Loads configuration from environment and config files.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("TRANSFER").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}
