//! Storage layer of the transfer file-sharing service.
//!
//! Uploads are grouped under short random tokens and kept in one of several
//! storage backends, each tracking per-file download limits and expiry.
//!
//! # Modules
//!
//! - `token` - Short random identifiers for uploads and deletion links
//! - `storage` - Backends, byte ranges, object metadata and download accounting

pub mod storage;
pub mod token;
