//! Minimal Drive v3 REST client.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use reqwest::{Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::auth::TokenSource;
use crate::storage::backend::{BodyStream, StorageResult};
use crate::storage::error::StorageError;
use crate::storage::range::Range;
use crate::storage::s3::PartReader;

const BACKEND: &str = "gdrive";
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// MIME type Drive uses for folders.
pub(crate) const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Page size for list queries.
const PAGE_SIZE: u32 = 100;

/// Resumable upload chunks must be a multiple of this.
pub(crate) const CHUNK_ALIGNMENT: u64 = 256 * 1024;

/// File resource fields used by the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

impl DriveFile {
    /// Size in bytes, `0` for folders and native Docs files.
    pub(crate) fn size(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, String>,
}

/// Quote a value for use inside a single-quoted Drive query string.
pub(crate) fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// `Content-Range` of a resumable upload chunk.
pub(crate) fn chunk_content_range(start: u64, len: u64, total: u64) -> String {
    if len == 0 {
        format!("bytes */{total}")
    } else {
        format!("bytes {}-{}/{}", start, start + len - 1, total)
    }
}

/// Chunk size in bytes for `mib` MiB, aligned to the resumable upload granularity.
pub(crate) fn chunk_size_bytes(mib: usize) -> u64 {
    let requested = (mib as u64).saturating_mul(1024 * 1024);
    (requested / CHUNK_ALIGNMENT).max(1) * CHUNK_ALIGNMENT
}

/// HTTP client for Drive calls.
///
/// 308 means "resume incomplete" to the upload endpoint, so it is never followed.
pub(crate) fn http_client() -> StorageResult<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            if attempt.status() == StatusCode::PERMANENT_REDIRECT || attempt.previous().len() >= 10 {
                attempt.stop()
            } else {
                attempt.follow()
            }
        }))
        .build()
        .map_err(|e| StorageError::configuration(e.to_string()))
}

/// Authenticated Drive client.
#[derive(Debug)]
pub(crate) struct DriveClient {
    http: reqwest::Client,
    tokens: TokenSource,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    pub(crate) fn new(http: reqwest::Client, tokens: TokenSource) -> Self {
        Self {
            http,
            tokens,
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
        }
    }

    /// Point the client at other metadata and upload endpoints.
    #[cfg(test)]
    pub(crate) fn with_bases(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base, urlencoding::encode(id))
    }

    async fn check(&self, resp: Response, what: &str) -> StorageResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => StorageError::not_found(what),
            StatusCode::UNAUTHORIZED => {
                StorageError::Unauthorized(format!("drive rejected credentials: {body}"))
            }
            _ => StorageError::provider(BACKEND, format!("{what} ({status}): {body}")),
        })
    }

    fn transport(err: &reqwest::Error) -> StorageError {
        StorageError::provider(BACKEND, err.to_string())
    }

    /// Every file matching `query`, following page tokens.
    pub(crate) async fn list(&self, query: &str, fields: &str) -> StorageResult<Vec<DriveFile>> {
        let fields = format!("nextPageToken,files({fields})");
        let page_size = PAGE_SIZE.to_string();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.tokens.access_token().await?;
            let mut params = vec![
                ("q", query),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
            ];
            if let Some(page) = page_token.as_deref() {
                params.push(("pageToken", page));
            }

            let resp = self
                .http
                .get(format!("{}/files", self.api_base))
                .bearer_auth(token)
                .query(&params)
                .send()
                .await
                .map_err(|e| Self::transport(&e))?;
            let page: DriveFileList = self
                .check(resp, "file list")
                .await?
                .json()
                .await
                .map_err(|e| Self::transport(&e))?;

            files.extend(page.files);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        Ok(files)
    }

    /// ID of the folder `name` directly under `parent`.
    pub(crate) async fn find_folder(&self, parent: &str, name: &str) -> StorageResult<Option<String>> {
        let query = format!(
            "'{}' in parents and name='{}' and mimeType='{FOLDER_MIME_TYPE}' and trashed=false",
            escape_query(parent),
            escape_query(name),
        );
        Ok(self.list(&query, "id,name,mimeType").await?.into_iter().next().map(|f| f.id))
    }

    /// ID of the non-folder file `name` directly under `parent`.
    pub(crate) async fn find_file(&self, parent: &str, name: &str) -> StorageResult<Option<String>> {
        let query = format!(
            "'{}' in parents and name='{}' and mimeType!='{FOLDER_MIME_TYPE}' and trashed=false",
            escape_query(parent),
            escape_query(name),
        );
        Ok(self.list(&query, "id,name,mimeType").await?.into_iter().next().map(|f| f.id))
    }

    pub(crate) async fn get_file(&self, id: &str, fields: &str) -> StorageResult<DriveFile> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .get(self.file_url(id))
            .bearer_auth(token)
            .query(&[("fields", fields)])
            .send()
            .await
            .map_err(|e| Self::transport(&e))?;
        self.check(resp, id)
            .await?
            .json()
            .await
            .map_err(|e| Self::transport(&e))
    }

    /// Create a folder and return its ID.
    pub(crate) async fn create_folder(&self, parent: Option<&str>, name: &str) -> StorageResult<String> {
        let token = self.tokens.access_token().await?;
        let body = NewFile {
            name,
            mime_type: FOLDER_MIME_TYPE,
            parents: parent.into_iter().collect(),
            properties: HashMap::new(),
        };
        let resp = self
            .http
            .post(format!("{}/files", self.api_base))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport(&e))?;
        let folder: DriveFile = self
            .check(resp, name)
            .await?
            .json()
            .await
            .map_err(|e| Self::transport(&e))?;
        debug!(name, id = %folder.id, "Created Drive folder");
        Ok(folder.id)
    }

    /// Stream the content of `id`, limited to `range` when given.
    ///
    /// A range starting past zero must be answered with `206 Partial Content`.
    pub(crate) async fn download(&self, id: &str, range: Option<Range>) -> StorageResult<BodyStream> {
        let token = self.tokens.access_token().await?;
        let mut req = self
            .http
            .get(self.file_url(id))
            .bearer_auth(token)
            .query(&[("alt", "media")]);
        if let Some(range) = range {
            req = req.header(header::RANGE, range.to_string());
        }
        let resp = req.send().await.map_err(|e| Self::transport(&e))?;
        let resp = self.check(resp, id).await?;
        if range.is_some_and(|r| r.start > 0) && resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(StorageError::provider(
                BACKEND,
                format!("{id}: range ignored ({})", resp.status()),
            ));
        }
        Ok(Box::pin(resp.bytes_stream().map_err(std::io::Error::other)))
    }

    /// Replace the given custom properties; `None` values remove a property.
    pub(crate) async fn update_properties(
        &self,
        id: &str,
        properties: &HashMap<String, Option<String>>,
    ) -> StorageResult<()> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .patch(self.file_url(id))
            .bearer_auth(token)
            .query(&[("fields", "id")])
            .json(&serde_json::json!({ "properties": properties }))
            .send()
            .await
            .map_err(|e| Self::transport(&e))?;
        self.check(resp, id).await?;
        Ok(())
    }

    pub(crate) async fn delete(&self, id: &str) -> StorageResult<()> {
        let token = self.tokens.access_token().await?;
        let resp = self
            .http
            .delete(self.file_url(id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| Self::transport(&e))?;
        self.check(resp, id).await?;
        Ok(())
    }

    /// Upload a new file in `chunk_size` pieces through a resumable session.
    ///
    /// The session is cancelled when the body fails or carries the wrong length.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn upload(
        &self,
        parent: &str,
        name: &str,
        content_type: &str,
        properties: HashMap<String, String>,
        body: BodyStream,
        content_length: u64,
        chunk_size: u64,
    ) -> StorageResult<String> {
        let session = self
            .start_session(parent, name, content_type, properties, content_length)
            .await?;

        match self
            .send_chunks(&session, name, body, content_length, chunk_size)
            .await
        {
            Ok(id) => Ok(id),
            Err(err) => {
                self.cancel_session(&session).await;
                Err(err)
            }
        }
    }

    async fn start_session(
        &self,
        parent: &str,
        name: &str,
        content_type: &str,
        properties: HashMap<String, String>,
        content_length: u64,
    ) -> StorageResult<String> {
        let token = self.tokens.access_token().await?;
        let body = NewFile {
            name,
            mime_type: content_type,
            parents: vec![parent],
            properties,
        };
        let resp = self
            .http
            .post(format!("{}/files", self.upload_base))
            .bearer_auth(token)
            .query(&[("uploadType", "resumable"), ("fields", "id")])
            .header("X-Upload-Content-Type", content_type)
            .header("X-Upload-Content-Length", content_length)
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport(&e))?;
        let resp = self.check(resp, name).await?;

        resp.headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| StorageError::provider(BACKEND, "resumable session without location"))
    }

    async fn send_chunks(
        &self,
        session: &str,
        name: &str,
        body: BodyStream,
        content_length: u64,
        chunk_size: u64,
    ) -> StorageResult<String> {
        let mut parts = PartReader::new(body);
        let mut offset = 0u64;

        loop {
            let chunk = parts.next_part(chunk_size).await?.unwrap_or_default();
            let len = chunk.len() as u64;
            if offset + len > content_length || (len == 0 && offset < content_length) {
                return Err(StorageError::LengthMismatch {
                    key: name.to_string(),
                    expected: content_length,
                    actual: offset + len + parts.drain().await?,
                });
            }

            let resp = self
                .put_chunk(session, chunk, offset, len, content_length)
                .await?;
            offset += len;

            if resp.status() == StatusCode::PERMANENT_REDIRECT {
                continue;
            }
            let file: DriveFile = self
                .check(resp, name)
                .await?
                .json()
                .await
                .map_err(|e| Self::transport(&e))?;
            if offset != content_length || parts.drain().await? != 0 {
                return Err(StorageError::provider(
                    BACKEND,
                    format!("upload of {name} finished early at {offset} bytes"),
                ));
            }
            return Ok(file.id);
        }
    }

    async fn put_chunk(
        &self,
        session: &str,
        chunk: Bytes,
        offset: u64,
        len: u64,
        total: u64,
    ) -> StorageResult<Response> {
        let token = self.tokens.access_token().await?;
        self.http
            .put(session)
            .bearer_auth(token)
            .header(header::CONTENT_LENGTH, len)
            .header(header::CONTENT_RANGE, chunk_content_range(offset, len, total))
            .body(chunk)
            .send()
            .await
            .map_err(|e| Self::transport(&e))
    }

    async fn cancel_session(&self, session: &str) {
        let Ok(token) = self.tokens.access_token().await else {
            return;
        };
        if let Err(err) = self.http.delete(session).bearer_auth(token).send().await {
            warn!(error = %err, "Failed to cancel Drive upload session");
        }
    }
}

/// Client against a mock server at `base`, with a non-expiring token cached in `dir`.
#[cfg(test)]
pub(crate) async fn mock_client(base: &str, dir: &std::path::Path) -> DriveClient {
    use super::auth::ClientSecret;

    let path = dir.join("token.json");
    std::fs::write(&path, r#"{"access_token":"test-token","token_type":"Bearer"}"#).unwrap();
    let secret = ClientSecret::from_json(
        br#"{"installed":{"client_id":"id","client_secret":"s","redirect_uris":["http://localhost"]}}"#,
    )
    .unwrap();
    let http = http_client().unwrap();
    let tokens = TokenSource::load(http.clone(), secret, path, None).await.unwrap();
    DriveClient::new(http, tokens).with_bases(
        &format!("{base}/drive/v3"),
        &format!("{base}/upload/drive/v3"),
    )
}
