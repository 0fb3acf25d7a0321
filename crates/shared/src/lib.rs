//! Shared configuration for the transfer storage workspace.
//!
//! This crate provides the types every other crate agrees on:
//! - Storage provider settings, one variant per backend
//! - Purge scheduling and retention settings
//! - Layered configuration loading (files, then environment)

pub mod config;

pub use config::{AppConfig, PurgeConfig, StorageSettings};
