use anthropic_ai_sdk::types::message as anthropic;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{
    ProviderAdapter, ProviderError, ProviderReply, ReplyUsage, join_url, send_json, send_probe,
};
use crate::http_client::client_for_url;
use crate::types::CompletionRequest;

const ANTHROPIC_VERSION: &str = "2023-06-01";
// Messages API 要求必须给出 max_tokens
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicAdapter {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: client_for_url(base_url)?,
            base_url: base_url.to_string(),
            api_key,
        })
    }

    pub fn convert_request(request: &CompletionRequest, model: &str) -> anthropic::CreateMessageParams {
        anthropic::CreateMessageParams {
            model: model.to_string(),
            system: request.system_prompt.clone(),
            messages: vec![anthropic::Message {
                role: anthropic::Role::User,
                content: anthropic::MessageContent::Text {
                    content: request.prompt.clone(),
                },
            }],
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            // Anthropic 的温度上限为 1.0
            temperature: request.temperature.map(|t| t.min(1.0)),
            stream: Some(false),
            ..Default::default()
        }
    }

    /// Strict decoding through the SDK response type, lenient read otherwise.
    pub fn parse_response(body: Value) -> ProviderReply {
        match serde_json::from_value::<anthropic::CreateMessageResponse>(body.clone()) {
            Ok(typed) => Self::convert_response(&typed),
            Err(e) => {
                tracing::debug!(error = %e, "Non-standard messages body, reading leniently");
                Self::lenient_response(&body)
            }
        }
    }

    pub fn convert_response(response: &anthropic::CreateMessageResponse) -> ProviderReply {
        let content = response
            .content
            .iter()
            .filter_map(|block| match block {
                anthropic::ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        ProviderReply {
            content,
            usage: Some(ReplyUsage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
            }),
        }
    }

    fn lenient_response(body: &Value) -> ProviderReply {
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let usage = body.get("usage").filter(|u| u.is_object()).map(|u| {
            let count = |field: &str| u.get(field).and_then(|x| x.as_u64()).unwrap_or(0) as u32;
            ReplyUsage {
                prompt_tokens: count("input_tokens"),
                completion_tokens: count("output_tokens"),
            }
        });

        ProviderReply { content, usage }
    }

    fn with_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn invoke(
        &self,
        request: &CompletionRequest,
        model: &str,
        timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        let url = join_url(&self.base_url, "/v1/messages");
        let body = Self::convert_request(request, model);
        let builder = self
            .with_headers(self.client.post(&url))
            .header("Content-Type", "application/json")
            .json(&body);

        let body: Value = send_json(builder, timeout).await?;
        Ok(Self::parse_response(body))
    }

    async fn probe(&self, timeout: Duration) -> Result<(), ProviderError> {
        let url = join_url(&self.base_url, "/v1/models");
        send_probe(self.with_headers(self.client.get(&url)), timeout).await
    }
}
