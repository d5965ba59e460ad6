use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::health::{CircuitState, HealthSnapshot};
use crate::providers::{ModelPricing, ModelSpec, ProviderDescriptor, Registry};
use crate::types::{CompletionRequest, LatencyClass};

/// One (provider, model) pair the orchestrator may attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
    pub pricing: ModelPricing,
    pub quality_rank: u8,
    pub estimated_cost: f64,
    pub score: f64,
    pub registration_index: usize,
}

struct Pending<'a> {
    descriptor: &'a ProviderDescriptor,
    spec: &'a ModelSpec,
    registration_index: usize,
    // 来自扩展阶段的候选排在所有偏好之后
    preference_index: usize,
    estimated_cost: f64,
}

pub struct ModelRouter {
    registry: Arc<Registry>,
    config: RoutingConfig,
}

impl ModelRouter {
    pub fn new(registry: Arc<Registry>, config: RoutingConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Rough prompt size: one token per four characters, rounded up.
    pub fn estimate_prompt_tokens(request: &CompletionRequest) -> u32 {
        let chars = request.prompt.chars().count()
            + request
                .system_prompt
                .as_deref()
                .map_or(0, |s| s.chars().count());
        u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
    }

    pub fn expected_output_tokens(&self, request: &CompletionRequest) -> u32 {
        request
            .max_tokens
            .unwrap_or(self.config.default_expected_output_tokens)
    }

    pub fn estimated_cost(&self, pricing: &ModelPricing, request: &CompletionRequest) -> f64 {
        pricing.cost_for(
            Self::estimate_prompt_tokens(request),
            self.expected_output_tokens(request),
        )
    }

    /// Whether any registered model could serve `request` within its budget.
    pub fn budget_attainable(&self, request: &CompletionRequest) -> bool {
        let Some(budget) = request.cost_budget else {
            return true;
        };
        self.registry.iter().any(|descriptor| {
            descriptor
                .models
                .iter()
                .any(|spec| self.estimated_cost(&spec.pricing, request) <= budget)
        })
    }

    /// Ordered candidate list for `request` under the given health view.
    ///
    /// Providers missing from `health` are treated as closed with no latency data.
    /// The result is a pure function of its inputs: equal inputs, equal order.
    pub fn select_candidates(
        &self,
        request: &CompletionRequest,
        health: &[HealthSnapshot],
    ) -> Vec<Candidate> {
        let health: HashMap<&str, &HealthSnapshot> =
            health.iter().map(|s| (s.provider.as_str(), s)).collect();
        let preference = &request.preference;
        let fits_budget = |cost: f64| request.cost_budget.is_none_or(|budget| cost <= budget);
        let is_open = |name: &str| health.get(name).is_some_and(|s| s.is_open());

        let mut seen: HashSet<(usize, &str)> = HashSet::new();
        let mut pending = Vec::new();

        for (preference_index, model_id) in preference.models.iter().enumerate() {
            for (registration_index, descriptor) in self.registry.iter().enumerate() {
                if !preference.primary.admits(descriptor.family) || is_open(&descriptor.name) {
                    continue;
                }
                let Some(spec) = descriptor.model(model_id) else {
                    continue;
                };
                let estimated_cost = self.estimated_cost(&spec.pricing, request);
                if !fits_budget(estimated_cost) || !seen.insert((registration_index, spec.id.as_str())) {
                    continue;
                }
                pending.push(Pending {
                    descriptor,
                    spec,
                    registration_index,
                    preference_index,
                    estimated_cost,
                });
            }
        }

        if pending.is_empty() && preference.primary.allows_widening() {
            let widened_index = preference.models.len();
            for (registration_index, descriptor) in self.registry.iter().enumerate() {
                if is_open(&descriptor.name) {
                    continue;
                }
                for spec in &descriptor.models {
                    let estimated_cost = self.estimated_cost(&spec.pricing, request);
                    if !fits_budget(estimated_cost) {
                        continue;
                    }
                    pending.push(Pending {
                        descriptor,
                        spec,
                        registration_index,
                        preference_index: widened_index,
                        estimated_cost,
                    });
                }
            }
            if !pending.is_empty() {
                tracing::debug!(
                    candidates = pending.len(),
                    "No preferred model available, widened to all healthy providers"
                );
            }
        }

        self.rank(request, pending, &health)
    }

    fn rank(
        &self,
        request: &CompletionRequest,
        pending: Vec<Pending<'_>>,
        health: &HashMap<&str, &HealthSnapshot>,
    ) -> Vec<Candidate> {
        let (w_cost, w_latency, w_quality) = request.preference.cost_priority.weights();
        let latency_class = request.preference.latency_class;
        let pinned = request.preference.primary.pinned_provider();

        // 成本按候选集内的 min/max 归一化
        let (min_cost, max_cost) = pending.iter().fold((f64::INFINITY, 0.0f64), |(lo, hi), p| {
            (lo.min(p.estimated_cost), hi.max(p.estimated_cost))
        });
        let cost_span = max_cost - min_cost;

        let mut scored: Vec<(bool, Candidate, usize)> = pending
            .into_iter()
            .map(|p| {
                let snapshot = health.get(p.descriptor.name.as_str()).copied();
                let cost_component = if cost_span > 0.0 {
                    (p.estimated_cost - min_cost) / cost_span
                } else {
                    0.0
                };
                let latency_component =
                    self.latency_component(snapshot.and_then(|s| s.p95_latency_ms), latency_class);
                let quality_component = quality_component(p.spec.quality_rank);

                let mut score = w_cost * cost_component
                    + w_latency * latency_component
                    + w_quality * quality_component;
                if let Some(s) = snapshot {
                    if s.rate_limited {
                        score += self.config.rate_limit_penalty_weight;
                    }
                    if s.circuit_state == CircuitState::HalfOpen {
                        score += self.config.half_open_penalty_weight;
                    }
                }

                let is_pinned = pinned.is_some_and(|name| name == p.descriptor.name);
                let candidate = Candidate {
                    provider: p.descriptor.name.clone(),
                    model: p.spec.id.clone(),
                    pricing: p.spec.pricing,
                    quality_rank: p.spec.quality_rank,
                    estimated_cost: p.estimated_cost,
                    score,
                    registration_index: p.registration_index,
                };
                (is_pinned, candidate, p.preference_index)
            })
            .collect();

        scored.sort_by(|(a_pin, a, a_pref), (b_pin, b, b_pref)| {
            b_pin
                .cmp(a_pin)
                .then_with(|| a.score.total_cmp(&b.score))
                .then_with(|| a.registration_index.cmp(&b.registration_index))
                .then_with(|| a_pref.cmp(b_pref))
        });

        scored.into_iter().map(|(_, c, _)| c).collect()
    }

    fn latency_component(&self, p95_ms: Option<u64>, class: LatencyClass) -> f64 {
        let Some(p95) = p95_ms else {
            return 0.5;
        };
        let realtime = self.config.realtime_latency_ms;
        let standard = self.config.standard_latency_ms;
        match class {
            LatencyClass::Batch => 0.0,
            LatencyClass::Realtime if p95 <= realtime => 0.0,
            LatencyClass::Realtime if p95 <= standard => 0.5,
            LatencyClass::Standard if p95 <= standard => 0.0,
            LatencyClass::Standard if p95 <= standard.saturating_mul(2) => 0.5,
            _ => 1.0,
        }
    }
}

/// Rank 10 maps to 0 (best), rank 1 to 1.
fn quality_component(rank: u8) -> f64 {
    f64::from(10 - rank.clamp(1, 10)) / 9.0
}
