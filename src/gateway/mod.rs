//! Fallback Orchestrator: the single entry point for completions.
//!
//! `complete` validates, consults the cache, routes, then walks the candidate
//! list in a spawned task. The caller only waits on a oneshot, so a caller that
//! goes away never cancels an upstream call already in flight: its outcome
//! still reaches the health monitor and the usage ledger.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cache::{self, ResponseCache};
use crate::config::{RoutingConfig, Settings};
use crate::error::{AttemptFailure, FailureKind, GatewayError, Result};
use crate::health::{self, HealthMonitor};
use crate::providers::{ProviderError, Registry};
use crate::routing::{Candidate, ModelRouter};
use crate::types::{CompletionRequest, CompletionResponse, Performance, ResponseMetadata, TokenUsage};
use crate::usage::UsageAccountant;

#[derive(Clone)]
pub struct Gateway {
    registry: Arc<Registry>,
    health: Arc<HealthMonitor>,
    cache: Arc<ResponseCache>,
    usage: Arc<UsageAccountant>,
    router: Arc<ModelRouter>,
    routing: RoutingConfig,
    request_timeout: Duration,
    sweep_interval: Duration,
}

impl Gateway {
    pub fn new(settings: &Settings, registry: Arc<Registry>, usage: Arc<UsageAccountant>) -> Self {
        let health = Arc::new(HealthMonitor::new(&registry, settings.health.clone()));
        let cache = Arc::new(ResponseCache::new(&settings.cache));
        let router = Arc::new(ModelRouter::new(registry.clone(), settings.routing.clone()));
        Self {
            registry,
            health,
            cache,
            usage,
            router,
            routing: settings.routing.clone(),
            request_timeout: settings.server.request_timeout(),
            sweep_interval: settings.cache.sweep_interval(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn usage(&self) -> &UsageAccountant {
        &self.usage
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Start the probe loop and the cache sweep.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![health::spawn_probe_loop(
            self.health.clone(),
            self.registry.clone(),
        )];
        if self.cache.is_enabled() {
            handles.push(cache::spawn_sweeper(self.cache.clone(), self.sweep_interval));
        }
        handles
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let started = Instant::now();
        let request = self.normalize(request)?;
        let temperature = request.effective_temperature(self.routing.default_temperature);

        let candidates = self.route(&request);

        // 写入缓存用的是实际服务的模型，查找时按候选顺序逐个模型尝试，
        // 最后补上未入选的偏好模型（例如熔断期间）
        let keys: Vec<String> = cache_models(&candidates, &request.preference.models)
            .into_iter()
            .map(|model| {
                cache::fingerprint(
                    &request.prompt,
                    request.system_prompt.as_deref(),
                    temperature,
                    model,
                )
            })
            .collect();
        if let Some(hit) = self.cache.get_first(&keys) {
            tracing::debug!(provider = %hit.provider, model = %hit.model_used, "Cache hit");
            return Ok(cached_response(hit, &request, started));
        }

        if candidates.is_empty() {
            tracing::warn!("No candidate survived routing");
            return Err(GatewayError::AllProvidersExhausted {
                failures: Vec::new(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let gateway = self.clone();
        tokio::spawn(async move {
            let outcome = gateway
                .attempt_candidates(&request, temperature, &candidates, &tx, started)
                .await;
            if tx.send(outcome).is_err() {
                tracing::debug!("Caller abandoned the request; result discarded");
            }
        });

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::Internal(
                "attempt task ended without a result".into(),
            )),
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "Request deadline elapsed; in-flight attempt continues in background"
                );
                Err(GatewayError::Timeout(self.request_timeout))
            }
        }
    }

    fn route(&self, request: &CompletionRequest) -> Vec<Candidate> {
        let snapshots = self.health.snapshot_all();
        self.router.select_candidates(request, &snapshots)
    }

    /// Reject malformed input and fill in the default temperature.
    fn normalize(&self, mut request: CompletionRequest) -> Result<CompletionRequest> {
        if request.prompt.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("prompt must not be empty".into()));
        }
        if let Some(t) = request.temperature {
            if !t.is_finite() || !(0.0..=2.0).contains(&t) {
                return Err(GatewayError::InvalidRequest(
                    "temperature must be within [0, 2]".into(),
                ));
            }
        }
        if request.max_tokens == Some(0) {
            return Err(GatewayError::InvalidRequest(
                "max_tokens must be positive".into(),
            ));
        }
        if let Some(budget) = request.cost_budget {
            if !budget.is_finite() || budget < 0.0 {
                return Err(GatewayError::InvalidRequest(
                    "cost_budget must be a non-negative number".into(),
                ));
            }
        }
        if request.preference.models.iter().any(|m| m.trim().is_empty()) {
            return Err(GatewayError::InvalidRequest(
                "model identifiers must not be empty".into(),
            ));
        }
        if !self.router.budget_attainable(&request) {
            return Err(GatewayError::InvalidRequest(format!(
                "cost_budget {} is below the estimated cost of every registered model",
                request.cost_budget.unwrap_or_default()
            )));
        }

        request.temperature = Some(request.effective_temperature(self.routing.default_temperature));
        Ok(request)
    }

    async fn attempt_candidates(
        &self,
        request: &CompletionRequest,
        temperature: f32,
        candidates: &[Candidate],
        reply: &oneshot::Sender<Result<CompletionResponse>>,
        started: Instant,
    ) -> Result<CompletionResponse> {
        let attempt_timeout = self.routing.attempt_timeout();
        let mut failures = Vec::new();

        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 && reply.is_closed() {
                tracing::debug!(
                    remaining = candidates.len() - index,
                    "Caller gone; not starting further candidates"
                );
                break;
            }

            let Some(descriptor) = self.registry.get(&candidate.provider) else {
                continue;
            };
            if !self.health.try_acquire(&candidate.provider) {
                failures.push(AttemptFailure {
                    provider: candidate.provider.clone(),
                    model: candidate.model.clone(),
                    kind: FailureKind::CircuitOpen,
                    message: "circuit open, attempt skipped".into(),
                });
                continue;
            }

            let attempt_started = Instant::now();
            let result = match tokio::time::timeout(
                attempt_timeout,
                descriptor
                    .adapter
                    .invoke(request, &candidate.model, attempt_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(attempt_timeout)),
            };
            let elapsed = attempt_started.elapsed();

            match result {
                Ok(provider_reply) => {
                    self.health.report_success(&candidate.provider, elapsed);

                    let (prompt_tokens, completion_tokens) = match provider_reply.usage {
                        Some(u) => (u.prompt_tokens, u.completion_tokens),
                        // 上游未返回用量时按字符数估算
                        None => (
                            ModelRouter::estimate_prompt_tokens(request),
                            estimate_tokens(&provider_reply.content),
                        ),
                    };
                    let record = self.usage.record(
                        &candidate.provider,
                        &candidate.model,
                        prompt_tokens,
                        completion_tokens,
                        candidate.pricing,
                    );

                    let response = CompletionResponse {
                        content: provider_reply.content,
                        model_used: candidate.model.clone(),
                        provider: candidate.provider.clone(),
                        usage: TokenUsage {
                            prompt_tokens,
                            completion_tokens,
                            total_tokens: record.total_tokens,
                            cost_estimate: record.cost,
                        },
                        performance: Performance {
                            response_time_ms: started.elapsed().as_millis() as u64,
                        },
                        metadata: ResponseMetadata {
                            fallback_used: index != 0,
                            cache_hit: false,
                            conversation_id: request.conversation_id.clone(),
                        },
                    };

                    let key = cache::fingerprint(
                        &request.prompt,
                        request.system_prompt.as_deref(),
                        temperature,
                        &candidate.model,
                    );
                    self.cache.insert(key, response.clone());

                    tracing::info!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        latency_ms = elapsed.as_millis() as u64,
                        fallback_used = index != 0,
                        cost = record.cost,
                        "Completion served"
                    );
                    return Ok(response);
                }
                Err(err) => {
                    let kind = err.kind();
                    tracing::warn!(
                        provider = %candidate.provider,
                        model = %candidate.model,
                        kind = kind.as_str(),
                        latency_ms = elapsed.as_millis() as u64,
                        "Attempt failed"
                    );
                    tracing::debug!(provider = %candidate.provider, error = %err, "Upstream failure detail");

                    if matches!(err, ProviderError::InvalidRequest(_)) {
                        // 请求本身有问题，换供应商也无济于事
                        self.health.release_trial(&candidate.provider);
                        return Err(GatewayError::InvalidRequest(format!(
                            "provider '{}' rejected the request as malformed",
                            candidate.provider
                        )));
                    }

                    self.health.report_failure(&candidate.provider, &err, elapsed);
                    failures.push(AttemptFailure {
                        provider: candidate.provider.clone(),
                        model: candidate.model.clone(),
                        kind,
                        message: sanitized_message(&err),
                    });
                }
            }
        }

        Err(GatewayError::AllProvidersExhausted { failures })
    }
}

fn cached_response(
    mut hit: CompletionResponse,
    request: &CompletionRequest,
    started: Instant,
) -> CompletionResponse {
    hit.usage.cost_estimate = 0.0;
    hit.performance.response_time_ms = started.elapsed().as_millis() as u64;
    hit.metadata = ResponseMetadata {
        fallback_used: false,
        cache_hit: true,
        conversation_id: request.conversation_id.clone(),
    };
    hit
}

/// Distinct model ids to try against the cache: candidates first, in routed order.
fn cache_models<'a>(candidates: &'a [Candidate], preferred: &'a [String]) -> Vec<&'a str> {
    let mut models: Vec<&str> = Vec::new();
    let ordered = candidates
        .iter()
        .map(|c| c.model.as_str())
        .chain(preferred.iter().map(String::as_str));
    for model in ordered {
        if !models.contains(&model) {
            models.push(model);
        }
    }
    models
}

fn estimate_tokens(text: &str) -> u32 {
    u32::try_from(text.chars().count().div_ceil(4)).unwrap_or(u32::MAX)
}

/// Caller-facing text for one failed attempt. Upstream bodies stay in the logs.
fn sanitized_message(err: &ProviderError) -> String {
    match err {
        ProviderError::InvalidRequest(_) => "provider rejected the request".into(),
        ProviderError::Unavailable(_) => "provider unavailable".into(),
        ProviderError::RateLimited { retry_after: Some(d) } => {
            format!("provider is rate limiting, retry after {}s", d.as_secs())
        }
        ProviderError::RateLimited { retry_after: None } => "provider is rate limiting".into(),
        ProviderError::Timeout(d) => format!("no response within {} ms", d.as_millis()),
    }
}
