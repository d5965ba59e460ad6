use serde::{Deserialize, Serialize};

use crate::config::ProviderFamily;

/// Canonical completion request as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(rename = "model_preference", default)]
    pub preference: ModelPreference,
    /// 调用方关联标识，不参与缓存指纹
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_budget: Option<f64>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            preference: ModelPreference::default(),
            conversation_id: None,
            cost_budget: None,
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preference.models = models.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Temperature after normalization; adapters always see `Some`.
    pub fn effective_temperature(&self, default: f32) -> f32 {
        self.temperature.unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelPreference {
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub primary: BackendHint,
    #[serde(default)]
    pub cost_priority: CostPriority,
    #[serde(default)]
    pub latency_class: LatencyClass,
}

/// Backend family hint. Any value other than `local`/`hosted`/`auto`
/// is read as a provider name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendHint {
    Local,
    Hosted,
    #[default]
    Auto,
    Provider(String),
}

impl From<String> for BackendHint {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Self::Local,
            "hosted" => Self::Hosted,
            "" | "auto" => Self::Auto,
            _ => Self::Provider(value.trim().to_string()),
        }
    }
}

impl From<BackendHint> for String {
    fn from(value: BackendHint) -> Self {
        match value {
            BackendHint::Local => "local".to_string(),
            BackendHint::Hosted => "hosted".to_string(),
            BackendHint::Auto => "auto".to_string(),
            BackendHint::Provider(name) => name,
        }
    }
}

impl BackendHint {
    pub fn admits(&self, family: ProviderFamily) -> bool {
        match self {
            Self::Local => family == ProviderFamily::Local,
            Self::Hosted => family == ProviderFamily::Hosted,
            Self::Auto | Self::Provider(_) => true,
        }
    }

    /// Whether an empty preference intersection may widen to every healthy provider.
    pub fn allows_widening(&self) -> bool {
        matches!(self, Self::Auto | Self::Provider(_))
    }

    pub fn pinned_provider(&self) -> Option<&str> {
        match self {
            Self::Provider(name) => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostPriority {
    Lowest,
    #[default]
    Balanced,
    Quality,
}

impl CostPriority {
    /// (cost, latency, quality)
    pub fn weights(&self) -> (f64, f64, f64) {
        match self {
            Self::Lowest => (0.6, 0.2, 0.2),
            Self::Balanced => (1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0),
            Self::Quality => (0.2, 0.2, 0.6),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Realtime,
    #[default]
    Standard,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model_used: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub performance: Performance,
    pub metadata: ResponseMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost_estimate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub response_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub fallback_used: bool,
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}
