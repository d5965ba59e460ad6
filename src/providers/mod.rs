//! Provider adapters: one per backend protocol, all behind [`ProviderAdapter`].
//!
//! Adapters translate the canonical [`CompletionRequest`] into a native call and
//! classify whatever comes back. They never retry; fallback lives in the
//! orchestrator.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;

use crate::error::FailureKind;
use crate::types::CompletionRequest;

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod registry;

pub use anthropic::AnthropicAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use registry::{ModelPricing, ModelSpec, ProviderDescriptor, Registry};

/// Token counts as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplyUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// What an adapter hands back on success. Provider and model attribution is
/// stamped by the orchestrator from the candidate it invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    /// `None` when the backend did not report usage.
    pub usage: Option<ReplyUsage>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("request rejected as malformed: {0}")]
    InvalidRequest(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Unavailable(_) => FailureKind::ProviderUnavailable,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Timeout(_) => FailureKind::Timeout,
        }
    }

    pub fn from_reqwest(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() {
            Self::Unavailable(format!("connection failed: {}", err))
        } else if err.is_decode() {
            Self::Unavailable(format!("malformed response body: {}", err))
        } else {
            Self::Unavailable(err.to_string())
        }
    }

    pub fn from_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::RateLimited { retry_after },
            StatusCode::BAD_REQUEST
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::UNPROCESSABLE_ENTITY => {
                Self::InvalidRequest(format!("HTTP {}: {}", status.as_u16(), truncate(body)))
            }
            _ => Self::Unavailable(format!("HTTP {}: {}", status.as_u16(), truncate(body))),
        }
    }
}

fn truncate(body: &str) -> &str {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body;
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

/// Retry-After 只支持秒数形式
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Execute one completion against `model`, finishing within `timeout`.
    async fn invoke(
        &self,
        request: &CompletionRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError>;

    /// Lightweight liveness check used by the health monitor's probe loop.
    async fn probe(&self, timeout: Duration) -> Result<(), ProviderError>;
}

/// Send `builder` and decode a JSON body, bounded by a caller-side timer.
pub(crate) async fn send_json<T: DeserializeOwned>(
    builder: RequestBuilder,
    timeout: Duration,
) -> Result<T, ProviderError> {
    let exchange = async {
        let response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, retry_after, &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

/// Probe variant of [`send_json`]: any 2xx counts as alive, the body is ignored.
pub(crate) async fn send_probe(
    builder: RequestBuilder,
    timeout: Duration,
) -> Result<(), ProviderError> {
    let exchange = async {
        let response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e, timeout))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProviderError::from_status(
                status,
                parse_retry_after(response.headers()),
                "",
            ))
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout)),
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}
