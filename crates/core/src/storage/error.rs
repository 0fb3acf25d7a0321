//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object or container not found in storage.
    #[error("file not found: {key}")]
    NotFound {
        /// Storage key that was not found.
        key: String,
    },

    /// Object exists but its metadata is missing, corrupt, or not ready yet.
    #[error("object {key} is not usable: {reason}")]
    Integrity {
        /// Storage key of the object.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The body did not carry the announced number of bytes.
    #[error("upload of {key} expected {expected} bytes, received {actual}")]
    LengthMismatch {
        /// Storage key of the upload.
        key: String,
        /// Announced content length.
        expected: u64,
        /// Bytes actually read from the body.
        actual: u64,
    },

    /// The object reached its maximum number of downloads.
    #[error("max downloads exceeded for {key}")]
    DownloadLimitReached {
        /// Storage key of the object.
        key: String,
    },

    /// The object is past its maximum retention date.
    #[error("file access expired for {key}")]
    Expired {
        /// Storage key of the object.
        key: String,
    },

    /// Provider credentials are missing and cannot be obtained.
    #[error("storage authorization required: {0}")]
    Unauthorized(String),

    /// Storage provider configuration error.
    #[error("storage configuration error: {0}")]
    Configuration(String),

    /// Provider operation failed (network, auth, throttling).
    #[error("{backend} operation failed: {message}")]
    Provider {
        /// Backend identifier.
        backend: &'static str,
        /// Provider error description.
        message: String,
    },

    /// Local I/O or body stream error.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Create a not found error.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create an integrity error.
    #[must_use]
    pub fn integrity(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Integrity {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a provider operation error.
    #[must_use]
    pub fn provider(backend: &'static str, msg: impl Into<String>) -> Self {
        Self::Provider {
            backend,
            message: msg.into(),
        }
    }

    /// Map an OpenDAL error for `key`, keeping not-found classification.
    #[must_use]
    pub fn from_opendal(backend: &'static str, key: &str, err: &opendal::Error) -> Self {
        match err.kind() {
            opendal::ErrorKind::NotFound => Self::not_found(key),
            _ => Self::provider(backend, err.to_string()),
        }
    }

    /// Returns true when the error means the object is absent or unusable.
    ///
    /// Integrity failures count as absent: a half-written or corrupt object
    /// must be reported to clients the same way as a missing one.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } | Self::Integrity { .. } => true,
            Self::Io(err) => err.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
