//! Backend upload intake: presign, transfer, confirm.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::debug;
use vigil_protocol::backend::{
    content_type_for, ApiErrorBody, CompleteRequest, CompleteResponse, PresignRequest,
    UploadTarget, CHECKSUM_HEADER, EVENT_ID_HEADER,
};
use vigil_protocol::config::{BackendConfig, TlsMaterial};

const MAX_ERROR_BODY: usize = 500;

/// Error classification for one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Network trouble or a temporary backend condition
    #[error("Transient error (retry eligible): {message}")]
    Transient { message: String },

    /// The backend's hash of the stored object differs from ours
    #[error("Checksum mismatch: {message}")]
    ChecksumMismatch { message: String },

    /// A 4xx answer other than a checksum mismatch
    #[error("Rejected by backend ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Retrying will not help (local file gone or changed)
    #[error("Permanent error (no retry): {message}")]
    Permanent { message: String },
}

impl UploadError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Check if this error is retry-eligible (until the attempt ceiling)
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, UploadError::Permanent { .. })
    }

    /// Classify a non-success HTTP answer.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
        let message = match &parsed {
            Some(err) => match &err.message {
                Some(m) => format!("{}: {}", err.error, m),
                None => err.error.clone(),
            },
            None => truncate(body),
        };

        if status == StatusCode::CONFLICT.as_u16()
            || parsed.as_ref().is_some_and(ApiErrorBody::is_checksum_mismatch)
        {
            return UploadError::ChecksumMismatch { message };
        }
        match status {
            408 | 429 | 500..=599 => UploadError::Transient {
                message: format!("HTTP {}: {}", status, message),
            },
            400..=499 => UploadError::Rejected { status, message },
            _ => UploadError::Transient {
                message: format!("unexpected HTTP {}: {}", status, message),
            },
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures (connect, timeout, reset) are all worth retrying.
        UploadError::Transient {
            message: err.to_string(),
        }
    }
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// The three round trips of the presigned-upload protocol.
#[async_trait]
pub trait UploadBackend: Send + Sync {
    async fn presign(&self, request: &PresignRequest) -> Result<UploadTarget, UploadError>;

    async fn transfer(
        &self,
        target: &UploadTarget,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
    ) -> Result<(), UploadError>;

    async fn confirm(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError>;
}

pub struct HttpUploadBackend {
    client: Client,
    presign_url: Url,
    complete_url: Url,
    api_token: Option<String>,
    transfer_timeout: Duration,
}

impl HttpUploadBackend {
    pub fn new(config: &BackendConfig, tls: Option<&TlsMaterial>) -> anyhow::Result<Self> {
        let client = http_client(config, tls)?;
        Ok(Self {
            client,
            presign_url: config.endpoint(&config.presign_endpoint)?,
            complete_url: config.endpoint(&config.complete_endpoint)?,
            api_token: config.api_token.clone(),
            transfer_timeout: config.transfer_timeout(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        }
    }
}

/// Client shared by the backend calls. With `tls` set the client presents
/// the device certificate and trusts the configured CA alongside the
/// built-in roots.
pub(crate) fn http_client(
    config: &BackendConfig,
    tls: Option<&TlsMaterial>,
) -> anyhow::Result<Client> {
    let mut builder = Client::builder().timeout(config.timeout());
    if let Some(tls) = tls {
        if let Some(pem) = tls.identity_pem() {
            let identity =
                reqwest::Identity::from_pem(&pem).context("Invalid client certificate or key")?;
            builder = builder.identity(identity);
        }
        if let Some(ca) = &tls.ca_cert {
            let ca = reqwest::Certificate::from_pem(ca).context("Invalid CA certificate")?;
            builder = builder.add_root_certificate(ca);
        }
    }
    builder.build().context("Failed to build HTTP client")
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::from_status(status.as_u16(), &body))
}

#[async_trait]
impl UploadBackend for HttpUploadBackend {
    async fn presign(&self, request: &PresignRequest) -> Result<UploadTarget, UploadError> {
        let response = self
            .authorized(self.client.post(self.presign_url.clone()))
            .header(EVENT_ID_HEADER, request.event_id.as_str())
            .json(request)
            .send()
            .await?;
        let target: UploadTarget = check(response).await?.json().await?;
        debug!(upload_id = %request.upload_id, "Presigned target received");
        Ok(target)
    }

    async fn transfer(
        &self,
        target: &UploadTarget,
        path: &Path,
        size_bytes: u64,
        checksum: &str,
    ) -> Result<(), UploadError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            UploadError::permanent(format!("cannot open {}: {}", path.display(), e))
        })?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let content_type = path
            .file_name()
            .map(|n| content_type_for(&n.to_string_lossy()))
            .unwrap_or("application/octet-stream");

        let mut request = self
            .client
            .put(&target.upload_url)
            .timeout(self.transfer_timeout)
            .header(CONTENT_LENGTH, size_bytes)
            .header(CONTENT_TYPE, content_type);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !target
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case(CHECKSUM_HEADER))
        {
            request = request.header(CHECKSUM_HEADER, checksum);
        }

        check(request.body(body).send().await?).await?;
        Ok(())
    }

    async fn confirm(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        let response = self
            .authorized(self.client.post(self.complete_url.clone()))
            .header(EVENT_ID_HEADER, request.event_id.as_str())
            .json(request)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }
}
