use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{BatchStatusResponse, QcApi, RemoteError, SubmitResponse};
use crate::config::ApiConfig;
use crate::model::BatchManifest;
use crate::sanitize::{redact_path, redact_url};

/// Error bodies are truncated before they are stored or logged.
const MAX_ERROR_BODY_LENGTH: usize = 200;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// [`QcApi`] over HTTPS with bearer authentication.
pub struct HttpQcApi {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpQcApi {
    pub fn new(
        endpoint: &str,
        api_key: Option<SecretString>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn from_config(config: &ApiConfig, api_key: Option<SecretString>) -> Result<Self, RemoteError> {
        Self::new(
            &config.endpoint,
            api_key,
            Duration::from_secs(config.request_timeout_secs.max(1)),
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    async fn check_status(response: Response) -> Result<Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            code: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

#[async_trait]
impl QcApi for HttpQcApi {
    async fn submit_batch(
        &self,
        archive: &Path,
        manifest: &BatchManifest,
    ) -> Result<SubmitResponse, RemoteError> {
        let bytes = tokio::fs::read(archive).await.map_err(|e| RemoteError::Io {
            path: archive.to_path_buf(),
            source: e,
        })?;
        let size = bytes.len();
        let manifest_json =
            serde_json::to_string(manifest).map_err(|e| RemoteError::Decode(e.to_string()))?;

        let form = Form::new()
            .part(
                "archive",
                Part::bytes(bytes)
                    .file_name(redact_path(archive))
                    .mime_str("application/zip")?,
            )
            .part(
                "manifest",
                Part::text(manifest_json).mime_str("application/json")?,
            );

        let url = format!("{}/batches", self.endpoint);
        info!(
            url = %redact_url(&url),
            batch_id = %manifest.batch_id,
            bytes = size,
            "Submitting batch"
        );

        let response = self
            .authorize(self.client.post(&url).multipart(form))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        response
            .json::<SubmitResponse>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn get_batch_status(
        &self,
        remote_batch_id: &str,
    ) -> Result<BatchStatusResponse, RemoteError> {
        let url = format!("{}/batches/{}", self.endpoint, remote_batch_id);
        debug!(url = %redact_url(&url), "Polling batch status");

        let response = self.authorize(self.client.get(&url)).send().await?;
        let response = Self::check_status(response).await?;
        response
            .json::<BatchStatusResponse>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn download_report(&self, url: &str, dest: &Path) -> Result<u64, RemoteError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RemoteError::Io { path, source }
        };

        let mut response = self.authorize(self.client.get(url)).send().await?;
        response = Self::check_status(response).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let partial = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(io_err(&partial))?;

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await.map_err(io_err(&partial))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err(&partial))?;
        drop(file);

        tokio::fs::rename(&partial, dest).await.map_err(io_err(dest))?;
        debug!(file = %redact_path(dest), bytes = written, "Report downloaded");
        Ok(written)
    }
}
