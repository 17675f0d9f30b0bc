//! HTTP implementation of the sync wire contract

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use super::{BatchRequest, BatchResponse, PullRequest, PullResponse, Transport, TransportError};
use crate::util::{compact_text, is_http_url, normalize_text_option};

#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let endpoint = normalize_endpoint(endpoint.into())?;
        Ok(Self {
            endpoint,
            token: normalize_text_option(token),
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", "application/json");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl Transport for HttpTransport {
    async fn send_batch(&self, request: &BatchRequest) -> Result<BatchResponse, TransportError> {
        tracing::debug!(
            "POST {}/v1/sync/batch with {} entries",
            self.endpoint,
            request.entries.len()
        );
        let response = self
            .authorize(self.client.post(format!("{}/v1/sync/batch", self.endpoint)))
            .json(request)
            .send()
            .await?;

        let response = ensure_success(response).await?;
        Ok(response.json::<BatchResponse>().await?)
    }

    async fn pull_changes(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        let url = format!(
            "{}/v1/sync/changes?tenantId={}&since={}&limit={}",
            self.endpoint,
            urlencoding::encode(&request.tenant_id),
            request.since,
            request.limit
        );
        let response = self.authorize(self.client.get(url)).send().await?;

        let response = ensure_success(response).await?;
        Ok(response.json::<PullResponse>().await?)
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        message: parse_api_error(status, &body),
    })
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    }
}

fn normalize_endpoint(raw: String) -> Result<String, TransportError> {
    let endpoint = normalize_text_option(Some(raw)).ok_or_else(|| {
        TransportError::InvalidConfiguration("endpoint must not be empty".to_string())
    })?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::InvalidConfiguration(
            "endpoint must include http:// or https://".to_string(),
        ))
    }
}
