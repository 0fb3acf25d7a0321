//! Storage backends for uploaded files.
//!
//! Every backend implements the same [`Storage`] contract over objects
//! addressed by `(token, filename)`:
//! - Local filesystem
//! - S3-compatible: AWS S3, MinIO, Cloudflare R2, DigitalOcean Spaces
//! - Azure Blob Storage
//! - Google Drive
//! - Storj
//! - WebDAV
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 DownloadLedger (limits, counters)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │                  Arc<dyn Storage> (from_settings)            │
//! ├───────────────────────────┬──────────────────┬───────────────┤
//! │ OpenDAL                   │ aws-sdk-s3       │ Drive REST    │
//! │ local, azure, webdav      │ s3, storj        │ gdrive        │
//! └───────────────────────────┴──────────────────┴───────────────┘
//! ```

mod azure;
mod backend;
mod config;
mod error;
mod gdrive;
mod ledger;
mod local;
mod metadata;
mod operator;
mod range;
mod s3;
mod storj;
mod webdav;

pub use azure::AzureStorage;
pub use backend::{BodyStream, Download, Storage, StorageKind, StorageResult, metadata_key, object_key};
pub use config::{BackendOptions, from_settings};
pub use error::StorageError;
pub use gdrive::{AuthorizationPrompt, GDriveOptions, GDriveStorage};
pub use ledger::DownloadLedger;
pub use local::LocalStorage;
pub use metadata::Metadata;
pub use range::Range;
pub use s3::{S3Options, S3Storage};
pub use storj::StorjStorage;
pub use webdav::WebDavStorage;
