//! OAuth credentials for the Drive API.
//!
//! The refresh token is cached on disk as the standard OAuth token JSON
//! (`access_token`, `token_type`, `refresh_token`, `expiry`), so caches written
//! by earlier deployments keep working.
//! Without a cache an [`AuthorizationPrompt`] has to supply a consent code.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::storage::backend::StorageResult;
use crate::storage::error::StorageError;

const BACKEND: &str = "gdrive";

/// Scopes requested at consent.
const SCOPES: &str = "https://www.googleapis.com/auth/drive https://www.googleapis.com/auth/drive.metadata";

/// Tokens are refreshed this long before they expire.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Obtains an authorization code for a consent URL.
///
/// Called once when no cached token exists. A terminal implementation prints
/// the URL and reads the code; a headless one may fail with `Unauthorized`.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    /// Return the authorization code the user obtained from `consent_url`.
    async fn authorization_code(&self, consent_url: &str) -> StorageResult<String>;
}

/// OAuth client registration, as downloaded from the Google console.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl ClientSecret {
    /// Parse a client secret file with an `installed` or `web` section.
    pub(crate) fn from_json(raw: &[u8]) -> StorageResult<Self> {
        let file: ClientSecretFile = serde_json::from_slice(raw)
            .map_err(|e| StorageError::configuration(format!("invalid client secret: {e}")))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| StorageError::configuration("client secret has no installed or web section"))
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map_or("http://localhost", String::as_str)
    }

    /// URL the user opens to grant access.
    pub(crate) fn consent_url(&self) -> String {
        format!(
            "{}?access_type=offline&client_id={}&redirect_uri={}&response_type=code&scope={}&state=state-token",
            self.auth_uri,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(self.redirect_uri()),
            urlencoding::encode(SCOPES),
        )
    }
}

/// Cached OAuth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CachedToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl CachedToken {
    /// Whether the token must be refreshed before use at `now`.
    ///
    /// A missing or zero expiry means the token does not expire.
    pub(crate) fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(expiry) if expiry.year() > 1 => {
                expiry - now < Duration::seconds(EXPIRY_SKEW_SECS)
            }
            _ => false,
        }
    }

    fn apply(&mut self, response: TokenResponse, now: DateTime<Utc>) {
        self.access_token = response.access_token;
        if let Some(token_type) = response.token_type {
            self.token_type = token_type;
        }
        if let Some(refresh) = response.refresh_token.filter(|t| !t.is_empty()) {
            self.refresh_token = refresh;
        }
        self.expiry = response
            .expires_in
            .map(|secs| now + Duration::seconds(secs));
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Hands out access tokens, refreshing and re-caching them as needed.
#[derive(Debug)]
pub(crate) struct TokenSource {
    http: reqwest::Client,
    secret: ClientSecret,
    cache_path: PathBuf,
    token: RwLock<CachedToken>,
}

impl TokenSource {
    /// Load the cached token, or run the consent flow through `prompt`.
    pub(crate) async fn load(
        http: reqwest::Client,
        secret: ClientSecret,
        cache_path: PathBuf,
        prompt: Option<&dyn AuthorizationPrompt>,
    ) -> StorageResult<Self> {
        let token = match tokio::fs::read(&cache_path).await {
            Ok(raw) => serde_json::from_slice::<CachedToken>(&raw).map_err(|e| {
                StorageError::configuration(format!(
                    "invalid token cache {}: {e}",
                    cache_path.display()
                ))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let prompt = prompt.ok_or_else(|| {
                    StorageError::Unauthorized(format!(
                        "no cached token at {} and no authorization prompt",
                        cache_path.display()
                    ))
                })?;
                let code = prompt.authorization_code(&secret.consent_url()).await?;
                let token = exchange_code(&http, &secret, code.trim()).await?;
                save_token(&cache_path, &token).await?;
                info!(path = %cache_path.display(), "Saved Drive credentials");
                token
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            http,
            secret,
            cache_path,
            token: RwLock::new(token),
        })
    }

    /// A valid access token.
    pub(crate) async fn access_token(&self) -> StorageResult<String> {
        {
            let token = self.token.read().await;
            if !token.expires_soon(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let mut token = self.token.write().await;
        let now = Utc::now();
        if !token.expires_soon(now) {
            return Ok(token.access_token.clone());
        }
        if token.refresh_token.is_empty() {
            return Err(StorageError::Unauthorized(
                "drive token expired and no refresh token is cached".to_string(),
            ));
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", token.refresh_token.as_str()),
            ("client_id", self.secret.client_id.as_str()),
            ("client_secret", self.secret.client_secret.as_str()),
        ];
        let response = request_token(&self.http, &self.secret.token_uri, &params).await?;
        token.apply(response, now);
        save_token(&self.cache_path, &token).await?;
        debug!("Refreshed Drive access token");
        Ok(token.access_token.clone())
    }
}

async fn exchange_code(
    http: &reqwest::Client,
    secret: &ClientSecret,
    code: &str,
) -> StorageResult<CachedToken> {
    let params = [
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", secret.redirect_uri()),
        ("client_id", secret.client_id.as_str()),
        ("client_secret", secret.client_secret.as_str()),
    ];
    let response = request_token(http, &secret.token_uri, &params).await?;
    let mut token = CachedToken {
        access_token: String::new(),
        token_type: "Bearer".to_string(),
        refresh_token: String::new(),
        expiry: None,
    };
    token.apply(response, Utc::now());
    Ok(token)
}

async fn request_token(
    http: &reqwest::Client,
    token_uri: &str,
    params: &[(&str, &str)],
) -> StorageResult<TokenResponse> {
    let resp = http
        .post(token_uri)
        .form(params)
        .send()
        .await
        .map_err(|e| StorageError::provider(BACKEND, format!("token request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(StorageError::Unauthorized(format!(
            "token exchange failed ({status}): {body}"
        )));
    }

    resp.json()
        .await
        .map_err(|e| StorageError::provider(BACKEND, format!("invalid token response: {e}")))
}

async fn save_token(path: &Path, token: &CachedToken) -> StorageResult<()> {
    let raw = serde_json::to_vec(token)
        .map_err(|e| StorageError::provider(BACKEND, e.to_string()))?;
    tokio::fs::write(path, raw).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
