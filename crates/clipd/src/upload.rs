//! Google Photos upload.
//!
//! Uploads are two calls: raw bytes to `/v1/uploads` (returns an opaque
//! upload token), then `mediaItems:batchCreate` referencing that token. Both
//! need a bearer token minted from a long-lived refresh token.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use crate::error::ClipError;

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const UPLOAD_URL: &str = "https://photoslibrary.googleapis.com/v1/uploads";
pub const CREATE_URL: &str = "https://photoslibrary.googleapis.com/v1/mediaItems:batchCreate";

/// Tokens this close to expiry are refreshed before use.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Duration,
}

/// Mints a fresh access token.
pub trait TokenSource {
    fn refresh(&self) -> impl Future<Output = Result<AccessToken, ClipError>> + Send;
}

/// Receives a finished clip.
pub trait Uploader {
    fn upload(
        &self,
        path: &Path,
        file_name: &str,
        description: &str,
    ) -> impl Future<Output = Result<serde_json::Value, ClipError>> + Send;
}

/// Cached bearer token with its expiry. Refreshes when absent or expired.
pub struct CredentialCache<S> {
    source: S,
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

impl<S: TokenSource> CredentialCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            token: None,
            expires_at: None,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        match (&self.token, self.expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at - chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            _ => false,
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub async fn get_or_refresh(&mut self, now: DateTime<Utc>) -> Result<String, ClipError> {
        if self.is_valid(now) {
            if let Some(token) = &self.token {
                return Ok(token.clone());
            }
        }

        let fresh = self.source.refresh().await?;
        let lifetime = chrono::Duration::from_std(fresh.expires_in).unwrap_or(chrono::Duration::zero());
        let expires_at = now + lifetime;
        tracing::info!(expires_at = %expires_at.to_rfc3339(), "refreshed photos access token");

        self.token = Some(fresh.token.clone());
        self.expires_at = Some(expires_at);
        Ok(fresh.token)
    }

    /// Forget the cached token, e.g. after the service rejected it.
    pub fn invalidate(&mut self) {
        self.token = None;
        self.expires_at = None;
    }
}

fn http_error(e: reqwest::Error, what: &'static str, timeout: Duration) -> ClipError {
    if e.is_timeout() {
        ClipError::Timeout {
            what,
            secs: timeout.as_secs(),
        }
    } else {
        ClipError::UploadFailed(format!("{what}: {e}"))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// OAuth refresh-token grant against Google's token endpoint.
pub struct GoogleTokenSource {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    timeout: Duration,
}

impl GoogleTokenSource {
    pub fn new(
        client: Client,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: refresh_token.to_string(),
            timeout,
        }
    }
}

impl TokenSource for GoogleTokenSource {
    async fn refresh(&self) -> Result<AccessToken, ClipError> {
        let resp = self
            .client
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", self.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| http_error(e, "token refresh", self.timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClipError::AuthFailure(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ClipError::AuthFailure(format!("malformed token response: {e}")))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_in: Duration::from_secs(body.expires_in),
        })
    }
}

pub struct PhotosUploader<S = GoogleTokenSource> {
    client: Client,
    upload_url: String,
    create_url: String,
    timeout: Duration,
    /// Bound for the raw-bytes request alone; clip size scales with duration.
    upload_timeout: Duration,
    credentials: Mutex<CredentialCache<S>>,
}

impl<S: TokenSource + Send> PhotosUploader<S> {
    pub fn new(client: Client, upload_url: &str, create_url: &str, timeout: Duration, source: S) -> Self {
        Self {
            client,
            upload_url: upload_url.to_string(),
            create_url: create_url.to_string(),
            timeout,
            upload_timeout: timeout,
            credentials: Mutex::new(CredentialCache::new(source)),
        }
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Refresh eagerly so the first trigger does not pay for it.
    pub async fn warm_up(&self) -> Result<(), ClipError> {
        self.credentials.lock().await.get_or_refresh(Utc::now()).await.map(|_| ())
    }

    async fn access_token(&self) -> Result<String, ClipError> {
        // Held across the refresh so concurrent callers never refresh twice.
        let mut creds = self.credentials.lock().await;
        creds.get_or_refresh(Utc::now()).await
    }

    async fn check(&self, resp: Response, step: &str) -> Result<Response, ClipError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.credentials.lock().await.invalidate();
            return Err(ClipError::AuthFailure(format!("{step} rejected credential ({status}): {body}")));
        }
        Err(ClipError::UploadFailed(format!("{step} returned {status}: {body}")))
    }
}

impl<S: TokenSource + Send> Uploader for PhotosUploader<S> {
    async fn upload(
        &self,
        path: &Path,
        file_name: &str,
        description: &str,
    ) -> Result<serde_json::Value, ClipError> {
        let token = self.access_token().await?;
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        // Streamed from disk; the clip is never held in memory whole.
        let resp = self
            .client
            .post(&self.upload_url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size)
            .header("X-Goog-Upload-File-Name", file_name)
            .header("X-Goog-Upload-Protocol", "raw")
            .timeout(self.upload_timeout)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| http_error(e, "raw upload", self.upload_timeout))?;
        let upload_token = self
            .check(resp, "raw upload")
            .await?
            .text()
            .await
            .map_err(|e| http_error(e, "raw upload", self.upload_timeout))?;

        tracing::debug!(file = file_name, bytes = size, "clip bytes uploaded");

        let body = serde_json::json!({
            "newMediaItems": [{
                "description": description,
                "simpleMediaItem": { "uploadToken": upload_token },
            }]
        });
        let resp = self
            .client
            .post(&self.create_url)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .map_err(|e| http_error(e, "media item creation", self.timeout))?;
        let result: serde_json::Value = self
            .check(resp, "media item creation")
            .await?
            .json()
            .await
            .map_err(|e| http_error(e, "media item creation", self.timeout))?;

        tracing::info!(file = file_name, bytes = size, "clip uploaded");
        Ok(result)
    }
}
