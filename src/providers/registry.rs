use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::{AnthropicAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter};
use crate::config::{AdapterKind, ProviderConfig, ProviderFamily, Settings};
use crate::error::Result;

/// Per-token prices for one model, in USD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}

impl ModelPricing {
    pub fn cost_for(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        f64::from(prompt_tokens) * self.input_cost_per_token
            + f64::from(completion_tokens) * self.output_cost_per_token
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    pub id: String,
    pub pricing: ModelPricing,
    /// 1..=10，越大质量越高
    pub quality_rank: u8,
}

/// Static registration record for one backend.
#[derive(Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub family: ProviderFamily,
    pub models: Vec<ModelSpec>,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("family", &self.family)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl ProviderDescriptor {
    pub fn model(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

/// Ordered set of providers, built once at startup and shared as `Arc<Registry>`.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    providers: Vec<Arc<ProviderDescriptor>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. Re-registering a name swaps the whole record in place,
    /// so the original registration position is kept.
    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        let descriptor = Arc::new(descriptor);
        match self
            .providers
            .iter()
            .position(|p| p.name == descriptor.name)
        {
            Some(idx) => self.providers[idx] = descriptor,
            None => self.providers.push(descriptor),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut registry = Self::new();
        for cfg in &settings.providers {
            registry.register(Self::descriptor_from_config(cfg)?);
        }
        Ok(registry)
    }

    fn descriptor_from_config(cfg: &ProviderConfig) -> Result<ProviderDescriptor> {
        let api_key = cfg.resolve_api_key();
        let family = cfg.family();
        if api_key.is_none() && family == ProviderFamily::Hosted {
            tracing::warn!(provider = %cfg.name, "Hosted provider has no API key configured");
        }

        let adapter: Arc<dyn ProviderAdapter> = match cfg.kind {
            AdapterKind::OpenAI => Arc::new(OpenAiAdapter::new(&cfg.base_url, api_key)?),
            AdapterKind::Anthropic => Arc::new(AnthropicAdapter::new(&cfg.base_url, api_key)?),
            AdapterKind::Ollama => Arc::new(OllamaAdapter::new(&cfg.base_url)?),
        };

        let models = cfg
            .models
            .iter()
            .map(|m| ModelSpec {
                id: m.id.clone(),
                pricing: ModelPricing {
                    input_cost_per_token: m.input_cost_per_token,
                    output_cost_per_token: m.output_cost_per_token,
                },
                quality_rank: m.quality_rank,
            })
            .collect();

        Ok(ProviderDescriptor {
            name: cfg.name.clone(),
            family,
            models,
            adapter,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProviderDescriptor>> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProviderDescriptor>> {
        self.providers.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
