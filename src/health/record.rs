use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// State change produced by an update, reported so the monitor can log it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { cooldown: Duration },
    Closed,
}

/// How one observed outcome should be folded into the record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Success { latency: Duration },
    Failure {
        kind: FailureKind,
        latency: Option<Duration>,
        retry_after: Option<Duration>,
    },
}

/// Point-in-time copy of a provider's health, safe to hand to readers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub circuit_state: CircuitState,
    pub window_successes: usize,
    pub window_failures: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub p50_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub last_probe_ok: Option<bool>,
    pub last_failure: Option<FailureKind>,
    pub rate_limited: bool,
    pub cooldown_remaining_ms: Option<u64>,
}

impl HealthSnapshot {
    pub fn is_open(&self) -> bool {
        self.circuit_state == CircuitState::Open
    }
}

/// Per-provider circuit breaker plus rolling statistics.
///
/// All methods take `now` explicitly; the owning monitor supplies the clock.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    window: VecDeque<bool>,
    state: CircuitState,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_started: Option<Instant>,
    latencies: VecDeque<u64>,
    total_successes: u64,
    total_failures: u64,
    consecutive_failures: u32,
    rate_limited_until: Option<Instant>,
    last_probe_at: Option<DateTime<Utc>>,
    last_probe_ok: Option<bool>,
    last_failure: Option<FailureKind>,
}

impl HealthRecord {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.window_size),
            state: CircuitState::Closed,
            opened_at: None,
            cooldown: config.cooldown(),
            trial_started: None,
            latencies: VecDeque::with_capacity(config.latency_samples),
            total_successes: 0,
            total_failures: 0,
            consecutive_failures: 0,
            rate_limited_until: None,
            last_probe_at: None,
            last_probe_ok: None,
            last_failure: None,
        }
    }

    /// State as seen at `now`: an open circuit whose cool-down elapsed reads as half-open.
    pub fn effective_state(&self, now: Instant) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) if now >= opened + self.cooldown => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Admission check before a real invocation. Half-open admits one trial per cool-down.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.effective_state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                self.state = CircuitState::HalfOpen;
                let trial_free = match self.trial_started {
                    None => true,
                    Some(started) => now >= started + self.cooldown,
                };
                if trial_free {
                    self.trial_started = Some(now);
                }
                trial_free
            }
        }
    }

    /// Give back a half-open permit whose attempt ended without a verdict.
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.trial_started = None;
        }
    }

    pub fn record(&mut self, config: &HealthConfig, outcome: Outcome, now: Instant) -> Option<Transition> {
        match outcome {
            Outcome::Success { latency } => {
                self.push_latency(config, latency);
                self.total_successes += 1;
                self.consecutive_failures = 0;
                match self.state {
                    CircuitState::HalfOpen => Some(self.close(config)),
                    CircuitState::Closed => {
                        self.push_window(config, true);
                        None
                    }
                    // 熔断前已放行的请求迟到的成功，不改变状态
                    CircuitState::Open => None,
                }
            }
            Outcome::Failure {
                kind,
                latency,
                retry_after,
            } => {
                if let Some(latency) = latency {
                    self.push_latency(config, latency);
                }
                self.total_failures += 1;
                self.last_failure = Some(kind);

                if kind == FailureKind::RateLimited {
                    let penalty = retry_after
                        .map_or(config.rate_limit_penalty(), |r| r.max(config.rate_limit_penalty()));
                    self.rate_limited_until = Some(now + penalty);
                    // 限流不计入熔断窗口；半开试探无结论，归还名额
                    self.release_trial();
                    return None;
                }

                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.fold_failure(config, now)
            }
        }
    }

    /// Fold a background probe result. Failed probes count against a closed
    /// circuit; successful ones only refresh liveness and latency.
    pub fn record_probe(
        &mut self,
        config: &HealthConfig,
        result: Result<Duration, FailureKind>,
        now: Instant,
        wall_clock: DateTime<Utc>,
    ) -> Option<Transition> {
        self.last_probe_at = Some(wall_clock);
        match result {
            Ok(latency) => {
                self.last_probe_ok = Some(true);
                self.push_latency(config, latency);
                None
            }
            Err(kind) => {
                self.last_probe_ok = Some(false);
                if self.state == CircuitState::Closed && kind != FailureKind::RateLimited {
                    self.fold_failure(config, now)
                } else {
                    None
                }
            }
        }
    }

    fn fold_failure(&mut self, config: &HealthConfig, now: Instant) -> Option<Transition> {
        match self.state {
            CircuitState::Closed => {
                self.push_window(config, false);
                if self.should_trip(config) {
                    self.cooldown = config.cooldown();
                    Some(self.open(now))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                let grown = self.cooldown.mul_f64(config.backoff_multiplier);
                self.cooldown = grown.min(config.max_cooldown());
                Some(self.open(now))
            }
            CircuitState::Open => None,
        }
    }

    fn should_trip(&self, config: &HealthConfig) -> bool {
        // 连续失败达到阈值直接熔断，不受窗口中更早的成功稀释
        if config.consecutive_failure_threshold > 0
            && self.consecutive_failures >= config.consecutive_failure_threshold
        {
            return true;
        }
        if self.window.len() < config.min_samples {
            return false;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64 > config.failure_threshold
    }

    fn open(&mut self, now: Instant) -> Transition {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trial_started = None;
        Transition::Opened {
            cooldown: self.cooldown,
        }
    }

    fn close(&mut self, config: &HealthConfig) -> Transition {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trial_started = None;
        self.cooldown = config.cooldown();
        self.window.clear();
        Transition::Closed
    }

    fn push_window(&mut self, config: &HealthConfig, ok: bool) {
        self.window.push_back(ok);
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }
    }

    fn push_latency(&mut self, config: &HealthConfig, latency: Duration) {
        if config.latency_samples == 0 {
            return;
        }
        self.latencies.push_back(latency.as_millis() as u64);
        while self.latencies.len() > config.latency_samples {
            self.latencies.pop_front();
        }
    }

    /// Nearest-rank percentile over the retained samples.
    pub fn latency_percentile(&self, pct: f64) -> Option<u64> {
        if self.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (pct * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    pub fn snapshot(&self, provider: &str, now: Instant) -> HealthSnapshot {
        let state = self.effective_state(now);
        let window_successes = self.window.iter().filter(|ok| **ok).count();
        let cooldown_remaining_ms = match (state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some((opened + self.cooldown).saturating_duration_since(now).as_millis() as u64)
            }
            _ => None,
        };

        HealthSnapshot {
            provider: provider.to_string(),
            circuit_state: state,
            window_successes,
            window_failures: self.window.len() - window_successes,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            consecutive_failures: self.consecutive_failures,
            p50_latency_ms: self.latency_percentile(0.50),
            p95_latency_ms: self.latency_percentile(0.95),
            last_probe_at: self.last_probe_at,
            last_probe_ok: self.last_probe_ok,
            last_failure: self.last_failure,
            rate_limited: self.rate_limited_until.is_some_and(|until| now < until),
            cooldown_remaining_ms,
        }
    }
}
