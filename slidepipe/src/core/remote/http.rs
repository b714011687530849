//! HTTP transport for the remote conversion service.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::{RemoteJobStatus, RemoteSubmission, RemoteTransport};
use crate::core::settings::RemoteSettings;
use crate::core::{CoreError, CoreResult};

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// `reqwest`-backed [`RemoteTransport`]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(settings: &RemoteSettings) -> CoreResult<Self> {
        let base_url = settings
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                CoreError::InvalidSettings("remote delegation requires a base URL".to_string())
            })?;
        let base_url = Self::validate_base_url(base_url)?;

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| CoreError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_token: settings.api_token.clone().filter(|token| !token.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    fn validate_base_url(url: &str) -> CoreResult<Url> {
        let parsed = reqwest::Url::parse(url).map_err(|e| {
            CoreError::InvalidSettings(format!("Invalid remote base URL '{}': {}", url, e))
        })?;

        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            scheme => Err(CoreError::InvalidSettings(format!(
                "Unsupported remote URL scheme '{}'. Only http/https are allowed.",
                scheme
            ))),
        }
    }

    fn conversions_url(&self) -> Url {
        self.endpoint(None)
    }

    /// Job ids are percent-encoded as a single path segment.
    fn conversion_url(&self, job_id: &str) -> Url {
        self.endpoint(Some(job_id))
    }

    fn endpoint(&self, job_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        // http(s) URLs always have a hierarchical path.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("conversions");
            if let Some(job_id) = job_id {
                segments.push(job_id);
            }
        }
        url
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Parse an error response body
    fn parse_api_error(status: StatusCode, body: &str) -> CoreError {
        if let Ok(err_resp) = serde_json::from_str::<ApiErrorResponse>(body) {
            if let Some(detail) = err_resp.error.or(err_resp.message) {
                return CoreError::RemoteRequestFailed(format!(
                    "Remote service error ({}): {}",
                    status, detail
                ));
            }
        }

        let truncated: String = body.chars().take(500).collect();
        CoreError::RemoteRequestFailed(format!("Remote service error ({}): {}", status, truncated))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> CoreResult<(StatusCode, String)> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| CoreError::RemoteRequestFailed(format!("Network error: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::RemoteRequestFailed(format!("Failed to read response: {}", e)))?;
        Ok((status, body))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn submit(&self, submission: &RemoteSubmission) -> CoreResult<String> {
        let (status, body) = self
            .send(self.client.post(self.conversions_url()).json(submission))
            .await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &body));
        }

        let parsed: SubmitResponse = serde_json::from_str(&body).map_err(|e| {
            CoreError::RemoteRequestFailed(format!("Failed to parse submit response: {}", e))
        })?;
        Ok(parsed.id)
    }

    async fn poll(&self, job_id: &str) -> CoreResult<RemoteJobStatus> {
        let (status, body) = self.send(self.client.get(self.conversion_url(job_id))).await?;
        if !status.is_success() {
            return Err(Self::parse_api_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            CoreError::RemoteRequestFailed(format!("Failed to parse poll response: {}", e))
        })
    }

    async fn cancel(&self, job_id: &str) -> CoreResult<()> {
        let (status, body) = self
            .send(self.client.delete(self.conversion_url(job_id)))
            .await?;

        // The job may already be gone.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!(job_id = %job_id, %status, "Remote cancel acknowledged");
            return Ok(());
        }
        Err(Self::parse_api_error(status, &body))
    }
}
