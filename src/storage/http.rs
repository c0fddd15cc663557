//! HTTP object store client.
//!
//! # Responsibilities
//! - Speak a minimal REST blob protocol:
//!   `GET {base}/{folder}/` (JSON listing), `GET/PUT/DELETE {base}/{path}`
//! - Attach bearer credentials when configured
//! - Retry transient failures with backoff, honouring `Retry-After`
//!
//! # Design Decisions
//! - 404 on download is `NotFound`; 404 on delete and listing is success/empty
//! - 401/403 surface immediately as `Unauthorized`
//! - Every request carries the configured client timeout

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use url::Url;

use crate::resilience::retries::{retry, RetryFailure, RetryPolicy};
use crate::storage::types::{FileInfo, StorageError, StorageResult};
use crate::storage::ObjectStore;

/// REST-style remote store.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    policy: RetryPolicy,
}

impl HttpStore {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        policy: RetryPolicy,
    ) -> StorageResult<Self> {
        let mut base = Url::parse(base_url)
            .map_err(|e| StorageError::InvalidPath(format!("{}: {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| StorageError::Transport(e.to_string()))?;

        tracing::info!(base_url = %base, "HTTP store client initialized");
        Ok(Self { client, base, token, policy })
    }

    fn url(&self, path: &str) -> StorageResult<Url> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|e| StorageError::InvalidPath(format!("{}: {}", path, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> StorageResult<Response> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))
    }

    async fn try_list(&self, folder: &str) -> StorageResult<Vec<FileInfo>> {
        let url = self.url(&format!("{}/", folder.trim_matches('/')))?;
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response, folder).await?;
        response
            .json::<Vec<FileInfo>>()
            .await
            .map_err(|e| StorageError::Transport(format!("invalid listing: {}", e)))
    }

    async fn try_download(&self, path: &str) -> StorageResult<Bytes> {
        let response = self.send(self.client.get(self.url(path)?)).await?;
        let response = check_status(response, path).await?;
        response
            .bytes()
            .await
            .map_err(|e| StorageError::Transport(e.to_string()))
    }

    async fn try_upload(&self, path: &str, data: Bytes) -> StorageResult<()> {
        let request = self
            .client
            .put(self.url(path)?)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);
        let response = self.send(request).await?;
        check_status(response, path).await?;
        Ok(())
    }

    async fn try_delete(&self, path: &str) -> StorageResult<()> {
        let response = self.send(self.client.delete(self.url(path)?)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, path).await?;
        Ok(())
    }
}

async fn check_status(response: Response, path: &str) -> StorageResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(path.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(StorageError::Unauthorized(status.as_u16()))
        }
        _ => {
            let retry_after = parse_retry_after(response.headers());
            let mut message = response.text().await.unwrap_or_default();
            message.truncate(200);
            Err(StorageError::Http {
                status: status.as_u16(),
                message,
                retry_after,
            })
        }
    }
}

/// Numeric `Retry-After` (delta-seconds). HTTP-date values fall back to backoff.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn flatten(failure: RetryFailure<StorageError>) -> StorageError {
    match failure {
        RetryFailure::Fatal(e) => e,
        RetryFailure::Exhausted { attempts, last } => StorageError::RetriesExhausted {
            attempts,
            source: Box::new(last),
        },
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn list_files(&self, folder: &str) -> StorageResult<Vec<FileInfo>> {
        retry(&self.policy, "list", || self.try_list(folder))
            .await
            .map_err(flatten)
    }

    async fn download_file(&self, path: &str) -> StorageResult<Bytes> {
        retry(&self.policy, "download", || self.try_download(path))
            .await
            .map_err(flatten)
    }

    async fn upload_file(&self, path: &str, data: Bytes) -> StorageResult<()> {
        retry(&self.policy, "upload", || self.try_upload(path, data.clone()))
            .await
            .map_err(flatten)
    }

    async fn delete_file(&self, path: &str) -> StorageResult<()> {
        retry(&self.policy, "delete", || self.try_delete(path))
            .await
            .map_err(flatten)
    }
}
