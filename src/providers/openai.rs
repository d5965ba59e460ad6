use async_openai::types as oai;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{
    ProviderAdapter, ProviderError, ProviderReply, ReplyUsage, join_url, send_json, send_probe,
};
use crate::http_client::client_for_url;
use crate::types::CompletionRequest;

// 请求与响应类型对齐 async-openai
pub use async_openai::types::{
    CompletionUsage as Usage, CreateChatCompletionRequest as ChatCompletionRequest,
    CreateChatCompletionResponse as ChatCompletionResponse,
};

/// OpenAI-compatible chat completions endpoint (OpenAI itself, vLLM, most proxies).
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiAdapter {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client_for_url(base_url)?,
            base_url: base_url.to_string(),
            api_key,
        })
    }

    #[allow(deprecated)]
    pub fn build_request(request: &CompletionRequest, model: &str) -> ChatCompletionRequest {
        let mut messages: Vec<oai::ChatCompletionRequestMessage> = Vec::with_capacity(2);
        if let Some(system) = request.system_prompt.as_deref() {
            messages.push(oai::ChatCompletionRequestMessage::System(
                oai::ChatCompletionRequestSystemMessage {
                    content: oai::ChatCompletionRequestSystemMessageContent::Text(system.to_string()),
                    name: None,
                },
            ));
        }
        messages.push(oai::ChatCompletionRequestMessage::User(
            oai::ChatCompletionRequestUserMessage {
                content: oai::ChatCompletionRequestUserMessageContent::Text(request.prompt.clone()),
                name: None,
            },
        ));

        // 兼容 vLLM 等只识别 max_tokens 的上游
        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(false),
            ..Default::default()
        }
    }

    /// Decode an upstream body. Strict decoding goes through the async-openai
    /// types; servers that omit required fields fall back to a lenient read.
    pub fn parse_response(body: Value) -> Result<ProviderReply, ProviderError> {
        match serde_json::from_value::<ChatCompletionResponse>(body.clone()) {
            Ok(typed) => Self::convert_response(typed),
            Err(e) => {
                tracing::debug!(error = %e, "Non-standard chat completion body, reading leniently");
                Self::lenient_response(&body)
            }
        }
    }

    pub fn convert_response(
        response: ChatCompletionResponse,
    ) -> Result<ProviderReply, ProviderError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Unavailable("response contained no choices".into()))?;

        Ok(ProviderReply {
            content: choice.message.content.unwrap_or_default(),
            usage: response.usage.map(reply_usage),
        })
    }

    fn lenient_response(body: &Value) -> Result<ProviderReply, ProviderError> {
        let message = body
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| ProviderError::Unavailable("response contained no choices".into()))?;
        let content = message
            .get("content")
            .and_then(|x| x.as_str())
            .unwrap_or_default()
            .to_string();

        let count = |u: &Value, field: &str| {
            u.get(field)
                .and_then(|x| x.as_u64())
                .map(|x| x as u32)
                .unwrap_or(0)
        };
        let usage = body.get("usage").filter(|u| u.is_object()).map(|u| Usage {
            prompt_tokens: count(u, "prompt_tokens"),
            completion_tokens: count(u, "completion_tokens"),
            total_tokens: count(u, "total_tokens"),
            prompt_tokens_details: None,
            completion_tokens_details: None,
        });

        Ok(ProviderReply {
            content,
            usage: usage.map(reply_usage),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }
}

fn reply_usage(usage: Usage) -> ReplyUsage {
    ReplyUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    async fn invoke(
        &self,
        request: &CompletionRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let url = join_url(&self.base_url, "/v1/chat/completions");
        let body = Self::build_request(request, model);
        let builder = self
            .authorized(self.client.post(&url))
            .header("Accept", "application/json")
            .json(&body);

        let body: Value = send_json(builder, timeout).await?;
        Self::parse_response(body)
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ProviderError> {
        let url = join_url(&self.base_url, "/v1/models");
        send_probe(self.authorized(self.client.get(&url)), timeout).await
    }
}
