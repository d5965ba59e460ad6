#![allow(dead_code)]

use async_trait::async_trait;
use llm_gateway::config::{ProviderFamily, Settings};
use llm_gateway::providers::{
    ModelPricing, ModelSpec, ProviderAdapter, ProviderDescriptor, ProviderError, ProviderReply,
    Registry, ReplyUsage,
};
use llm_gateway::usage::UsageAccountant;
use llm_gateway::{CompletionRequest, Gateway};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process adapter with a fixed behaviour, counting every invocation.
pub struct ScriptedAdapter {
    reply: Mutex<Result<ProviderReply, ProviderError>>,
    delay: Duration,
    calls: AtomicUsize,
    seen_models: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn replying(content: &str, usage: Option<ReplyUsage>) -> Arc<Self> {
        Self::with(Ok(ProviderReply {
            content: content.to_string(),
            usage,
        }))
    }

    pub fn failing(error: ProviderError) -> Arc<Self> {
        Self::with(Err(error))
    }

    fn with(reply: Result<ProviderReply, ProviderError>) -> Arc<Self> {
        Self::slow(reply, Duration::ZERO)
    }

    pub fn slow(reply: Result<ProviderReply, ProviderError>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            delay,
            calls: AtomicUsize::new(0),
            seen_models: Mutex::new(Vec::new()),
        })
    }

    /// Switch a failing adapter to succeed with `content` from now on.
    pub fn recover(&self, content: &str) {
        *self.reply.lock().unwrap() = Ok(ProviderReply {
            content: content.to_string(),
            usage: None,
        });
    }

    /// Switch the adapter to fail with `error` from now on.
    pub fn break_with(&self, error: ProviderError) {
        *self.reply.lock().unwrap() = Err(error);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_models(&self) -> Vec<String> {
        self.seen_models.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    async fn invoke(
        &self,
        _request: &CompletionRequest,
        model: &str,
        _timeout: Duration,
    ) -> Result<ProviderReply, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_models.lock().unwrap().push(model.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply.lock().unwrap().clone()
    }

    async fn probe(&self, _timeout: Duration) -> Result<(), ProviderError> {
        Ok(())
    }
}

pub fn model(id: &str, input_cost: f64, output_cost: f64) -> ModelSpec {
    ModelSpec {
        id: id.to_string(),
        pricing: ModelPricing {
            input_cost_per_token: input_cost,
            output_cost_per_token: output_cost,
        },
        quality_rank: 5,
    }
}

pub fn registry(entries: Vec<(&str, Vec<ModelSpec>, Arc<ScriptedAdapter>)>) -> Arc<Registry> {
    let mut registry = Registry::new();
    for (name, models, adapter) in entries {
        registry.register(ProviderDescriptor {
            name: name.to_string(),
            family: ProviderFamily::Hosted,
            models,
            adapter,
        });
    }
    Arc::new(registry)
}

pub fn gateway(registry: Arc<Registry>) -> Gateway {
    gateway_with(registry, Settings::default())
}

pub fn gateway_with(registry: Arc<Registry>, settings: Settings) -> Gateway {
    Gateway::new(&settings, registry, Arc::new(UsageAccountant::new()))
}

pub fn unavailable() -> ProviderError {
    ProviderError::Unavailable("HTTP 502: upstream exploded with internal detail".into())
}
