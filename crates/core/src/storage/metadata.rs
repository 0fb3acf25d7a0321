//! Per-object metadata record.
//!
//! The JSON encoding matches the sidecar files written by earlier deployments:
//! PascalCase keys, `-1` for unlimited downloads and the zero timestamp
//! `0001-01-01T00:00:00Z` for "no expiry".

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// Property key holding the download counter.
pub const PROP_DOWNLOADS: &str = "downloads";
/// Property key holding the download limit.
pub const PROP_MAX_DOWNLOADS: &str = "maxDownloads";
/// Property key holding the deletion token.
pub const PROP_DELETION_TOKEN: &str = "deletionToken";
/// Property key holding the deletion secret.
pub const PROP_DELETION_SECRET: &str = "deletionSecret";
/// Property key holding the expiry date (RFC 3339).
pub const PROP_MAX_DATE: &str = "maxDate";

/// Attributes stored alongside every object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Metadata {
    /// Content type given at upload.
    pub content_type: String,
    /// Length of the stored object in bytes.
    pub content_length: u64,
    /// Number of completed downloads.
    pub downloads: u32,
    /// Download limit, `None` for unlimited.
    #[serde(with = "unlimited")]
    pub max_downloads: Option<u32>,
    /// Expiry date, `None` for no expiry.
    #[serde(with = "zero_time")]
    pub max_date: Option<DateTime<Utc>>,
    /// Token the caller must present to delete the object.
    pub deletion_token: String,
    /// Secret shared with the uploader.
    pub secret: String,
}

impl Metadata {
    /// Create metadata for a fresh upload with no limits.
    #[must_use]
    pub fn new(content_type: impl Into<String>, content_length: u64) -> Self {
        Self {
            content_type: content_type.into(),
            content_length,
            downloads: 0,
            max_downloads: None,
            max_date: None,
            deletion_token: String::new(),
            secret: String::new(),
        }
    }

    /// Limit the number of downloads.
    #[must_use]
    pub fn with_max_downloads(mut self, max: u32) -> Self {
        self.max_downloads = Some(max);
        self
    }

    /// Expire the object at `date`.
    #[must_use]
    pub fn with_max_date(mut self, date: DateTime<Utc>) -> Self {
        self.max_date = Some(date);
        self
    }

    /// Set the deletion token.
    #[must_use]
    pub fn with_deletion_token(mut self, token: impl Into<String>) -> Self {
        self.deletion_token = token.into();
        self
    }

    /// Set the deletion secret.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Fails when the download limit is reached or the expiry date has passed.
    pub fn check_available(&self, key: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        if self.max_downloads.is_some_and(|max| self.downloads >= max) {
            return Err(StorageError::DownloadLimitReached { key: key.into() });
        }
        if self.max_date.is_some_and(|date| now > date) {
            return Err(StorageError::Expired { key: key.into() });
        }
        Ok(())
    }

    /// Values for the `X-Remaining-Downloads` and `X-Remaining-Days` headers.
    ///
    /// Unlimited values render as `n/a`.
    #[must_use]
    pub fn remaining_limit_header_values(&self, now: DateTime<Utc>) -> (String, String) {
        let downloads = self.max_downloads.map_or_else(
            || "n/a".to_string(),
            |max| (i64::from(max) - i64::from(self.downloads)).to_string(),
        );
        let days = self.max_date.map_or_else(
            || "n/a".to_string(),
            |date| ((date - now).num_hours() / 24 + 1).to_string(),
        );
        (downloads, days)
    }

    /// Provider properties for backends storing metadata as key/value headers.
    #[must_use]
    pub fn to_properties(&self) -> HashMap<String, String> {
        let mut props = HashMap::from([
            (PROP_DOWNLOADS.to_string(), self.downloads.to_string()),
            (
                PROP_MAX_DOWNLOADS.to_string(),
                self.max_downloads.map_or(-1, i64::from).to_string(),
            ),
            (PROP_DELETION_TOKEN.to_string(), self.deletion_token.clone()),
            (PROP_DELETION_SECRET.to_string(), self.secret.clone()),
        ]);
        if let Some(date) = self.max_date {
            props.insert(PROP_MAX_DATE.to_string(), date.to_rfc3339());
        }
        props
    }

    /// Rebuild metadata from provider properties.
    ///
    /// Keys are matched case-insensitively since some providers lowercase them.
    /// A missing or unparsable counter is an integrity error, never a zero.
    pub fn from_properties(
        key: &str,
        props: &HashMap<String, String>,
        content_type: impl Into<String>,
        content_length: u64,
    ) -> Result<Self, StorageError> {
        let lookup = |name: &str| {
            props
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };

        let downloads = lookup(PROP_DOWNLOADS)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| StorageError::integrity(key, "download counter missing or invalid"))?;
        let max_downloads = lookup(PROP_MAX_DOWNLOADS)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| StorageError::integrity(key, "download limit missing or invalid"))?;
        let max_date = lookup(PROP_MAX_DATE)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc));

        Ok(Self {
            content_type: content_type.into(),
            content_length,
            downloads,
            max_downloads: u32::try_from(max_downloads).ok(),
            max_date,
            deletion_token: lookup(PROP_DELETION_TOKEN).unwrap_or_default().to_string(),
            secret: lookup(PROP_DELETION_SECRET).unwrap_or_default().to_string(),
        })
    }

    /// Encode as sidecar JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self)
            .map_err(|e| StorageError::integrity("metadata", format!("encode failed: {e}")))
    }

    /// Decode sidecar JSON stored for `key`.
    pub fn from_json(key: &str, raw: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(raw).map_err(|e| StorageError::integrity(key, e.to_string()))
    }
}

mod unlimited {
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<u32>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(value.map_or(-1, i64::from))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let raw = i64::deserialize(d)?;
        Ok(u32::try_from(raw).ok())
    }
}

mod zero_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const ZERO: &str = "0001-01-01T00:00:00Z";

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => s.serialize_str(&date.to_rfc3339()),
            None => s.serialize_str(ZERO),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = String::deserialize(d)?;
        if raw == ZERO {
            return Ok(None);
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|date| Some(date.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}
