use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    ProviderAdapter, ProviderError, ProviderReply, ReplyUsage, join_url, send_json, send_probe,
};
use crate::http_client::client_for_url;
use crate::types::CompletionRequest;

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<OllamaMessage<'a>>,
    pub stream: bool,
    pub options: OllamaOptions,
}

#[derive(Debug, Serialize)]
pub struct OllamaMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

#[derive(Debug, Default, Serialize)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    #[serde(default)]
    pub message: Option<OllamaResponseMessage>,
    #[serde(default)]
    pub prompt_eval_count: Option<u32>,
    #[serde(default)]
    pub eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaResponseMessage {
    #[serde(default)]
    pub content: String,
}

/// Locally hosted model runner speaking the Ollama HTTP API.
pub struct OllamaAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaAdapter {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client_for_url(base_url)?,
            base_url: base_url.to_string(),
        })
    }

    pub fn convert_request<'a>(
        request: &'a CompletionRequest,
        model: &'a str,
    ) -> OllamaChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(OllamaMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OllamaMessage {
            role: "user",
            content: &request.prompt,
        });

        OllamaChatRequest {
            model,
            messages,
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        }
    }

    pub fn convert_response(response: OllamaChatResponse) -> Result<ProviderReply, ProviderError> {
        let message = response
            .message
            .ok_or_else(|| ProviderError::Unavailable("response carried no message".into()))?;

        // 两个计数都缺失时交由编排器估算
        let usage = match (response.prompt_eval_count, response.eval_count) {
            (None, None) => None,
            (p, c) => Some(ReplyUsage {
                prompt_tokens: p.unwrap_or(0),
                completion_tokens: c.unwrap_or(0),
            }),
        };

        Ok(ProviderReply {
            content: message.content,
            usage,
        })
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    async fn invoke(
        &self,
        request: &CompletionRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let url = join_url(&self.base_url, "/api/chat");
        let body = Self::convert_request(request, model);
        let builder = self.client.post(&url).json(&body);

        let response: OllamaChatResponse = send_json(builder, timeout).await?;
        Self::convert_response(response)
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ProviderError> {
        let url = join_url(&self.base_url, "/api/tags");
        send_probe(self.client.get(&url), timeout).await
    }
}
