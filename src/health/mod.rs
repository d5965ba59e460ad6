//! Health Monitor: one circuit-breaking [`HealthRecord`] per registered provider.
//!
//! Writers (the orchestrator and the probe loop) update records under a
//! per-provider mutex; readers only ever get [`HealthSnapshot`] copies.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::error::FailureKind;
use crate::providers::{ProviderError, Registry};

mod probe;
mod record;

pub use probe::{probe_all, spawn_probe_loop};
pub use record::{CircuitState, HealthRecord, HealthSnapshot, Outcome, Transition};

pub struct HealthMonitor {
    config: HealthConfig,
    records: HashMap<String, Mutex<HealthRecord>>,
    // 快照按注册顺序输出
    order: Vec<String>,
}

impl HealthMonitor {
    pub fn new(registry: &Registry, config: HealthConfig) -> Self {
        let order: Vec<String> = registry.names().map(str::to_string).collect();
        let records = order
            .iter()
            .map(|name| (name.clone(), Mutex::new(HealthRecord::new(&config))))
            .collect();
        Self {
            config,
            records,
            order,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn with_record<R>(&self, provider: &str, f: impl FnOnce(&mut HealthRecord) -> R) -> Option<R> {
        let Some(slot) = self.records.get(provider) else {
            tracing::debug!(provider = %provider, "Health update for unregistered provider ignored");
            return None;
        };
        let mut record = slot.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&mut record))
    }

    /// Ask whether a real invocation may go out now. Consumes the half-open
    /// trial permit when the circuit is probing.
    pub fn try_acquire(&self, provider: &str) -> bool {
        self.with_record(provider, |r| r.admit(Instant::now()))
            .unwrap_or(false)
    }

    pub fn release_trial(&self, provider: &str) {
        self.with_record(provider, |r| r.release_trial());
    }

    pub fn report_success(&self, provider: &str, latency: Duration) {
        self.apply(provider, Outcome::Success { latency });
    }

    pub fn report_failure(&self, provider: &str, error: &ProviderError, elapsed: Duration) {
        let (latency, retry_after) = match error {
            // 超时按截止时长记为观测延迟
            ProviderError::Timeout(deadline) => (Some(*deadline), None),
            ProviderError::RateLimited { retry_after } => (None, *retry_after),
            _ => (Some(elapsed), None),
        };
        self.apply(
            provider,
            Outcome::Failure {
                kind: error.kind(),
                latency,
                retry_after,
            },
        );
    }

    pub fn record_probe(&self, provider: &str, result: Result<Duration, FailureKind>) {
        let transition = self.with_record(provider, |r| {
            r.record_probe(&self.config, result, Instant::now(), Utc::now())
        });
        if let Some(Some(t)) = transition {
            log_transition(provider, t, "probe");
        }
    }

    fn apply(&self, provider: &str, outcome: Outcome) {
        let transition =
            self.with_record(provider, |r| r.record(&self.config, outcome, Instant::now()));
        if let Some(Some(t)) = transition {
            log_transition(provider, t, "request");
        }
    }

    pub fn snapshot(&self, provider: &str) -> Option<HealthSnapshot> {
        let now = Instant::now();
        self.with_record(provider, |r| r.snapshot(provider, now))
    }

    /// Snapshot of every provider, in registration order.
    pub fn snapshot_all(&self) -> Vec<HealthSnapshot> {
        self.order
            .iter()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }
}

fn log_transition(provider: &str, transition: Transition, source: &str) {
    match transition {
        Transition::Opened { cooldown } => tracing::warn!(
            provider = %provider,
            source,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit opened"
        ),
        Transition::Closed => {
            tracing::info!(provider = %provider, source, "Circuit closed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderFamily;
    use crate::providers::{ProviderAdapter, ProviderDescriptor, ProviderReply};
    use crate::types::CompletionRequest;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Idle;

    #[async_trait]
    impl ProviderAdapter for Idle {
        async fn invoke(
            &self,
            _request: &CompletionRequest,
            _model: &str,
            _timeout: Duration,
        ) -> Result<ProviderReply, ProviderError> {
            Err(ProviderError::Unavailable("idle".into()))
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    enum Liveness {
        Alive,
        Refused,
        Hang,
    }

    struct Pinged(Liveness);

    #[async_trait]
    impl ProviderAdapter for Pinged {
        async fn invoke(
            &self,
            _request: &CompletionRequest,
            _model: &str,
            _timeout: Duration,
        ) -> Result<ProviderReply, ProviderError> {
            Err(ProviderError::Unavailable("not used".into()))
        }

        async fn probe(&self, _timeout: Duration) -> Result<(), ProviderError> {
            match self.0 {
                Liveness::Alive => Ok(()),
                Liveness::Refused => Err(ProviderError::Unavailable("connection refused".into())),
                // 故意无视传入的时限，由外层兜底
                Liveness::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            }
        }
    }

    fn registry(names: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for name in names {
            registry.register(ProviderDescriptor {
                name: name.to_string(),
                family: ProviderFamily::Hosted,
                models: vec![],
                adapter: Arc::new(Idle),
            });
        }
        registry
    }

    #[test]
    fn snapshots_follow_registration_order() {
        let monitor = HealthMonitor::new(&registry(&["b", "a", "c"]), HealthConfig::default());
        let names: Vec<_> = monitor
            .snapshot_all()
            .into_iter()
            .map(|s| s.provider)
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn timeout_reports_deadline_as_latency() {
        let monitor = HealthMonitor::new(&registry(&["p"]), HealthConfig::default());
        monitor.report_failure(
            "p",
            &ProviderError::Timeout(Duration::from_millis(750)),
            Duration::from_millis(751),
        );
        let snap = monitor.snapshot("p").unwrap();
        assert_eq!(snap.p95_latency_ms, Some(750));
        assert_eq!(snap.last_failure, Some(FailureKind::Timeout));
    }

    #[test]
    fn unknown_providers_are_ignored() {
        let monitor = HealthMonitor::new(&registry(&["p"]), HealthConfig::default());
        monitor.report_success("ghost", Duration::from_millis(1));
        assert!(!monitor.try_acquire("ghost"));
        assert!(monitor.snapshot("ghost").is_none());
    }

    #[test]
    fn concurrent_reports_are_all_counted() {
        let monitor = Arc::new(HealthMonitor::new(
            &registry(&["p"]),
            HealthConfig {
                window_size: 1_000,
                min_samples: 1_000,
                consecutive_failure_threshold: 0,
                ..HealthConfig::default()
            },
        ));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        if i % 2 == 0 {
                            monitor.report_success("p", Duration::from_millis(5));
                        } else {
                            monitor.report_failure(
                                "p",
                                &ProviderError::Unavailable("x".into()),
                                Duration::from_millis(5),
                            );
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = monitor.snapshot("p").unwrap();
        assert_eq!(snap.total_successes, 200);
        assert_eq!(snap.total_failures, 200);
        assert_eq!(snap.window_successes + snap.window_failures, 400);
        assert_eq!(snap.circuit_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn liveness_round_feeds_monitor_and_trips_dead_providers() {
        let mut registry = Registry::new();
        for (name, behaviour) in [
            ("alive", Liveness::Alive),
            ("refused", Liveness::Refused),
            ("hung", Liveness::Hang),
        ] {
            registry.register(ProviderDescriptor {
                name: name.to_string(),
                family: ProviderFamily::Hosted,
                models: vec![],
                adapter: Arc::new(Pinged(behaviour)),
            });
        }
        let monitor = HealthMonitor::new(
            &registry,
            HealthConfig {
                probe_timeout_ms: 50,
                ..HealthConfig::default()
            },
        );

        probe_all(&monitor, &registry).await;
        for name in ["refused", "hung"] {
            let snap = monitor.snapshot(name).unwrap();
            assert_eq!(snap.last_probe_ok, Some(false), "{name}");
            assert!(snap.last_probe_at.is_some());
            assert_eq!(snap.window_failures, 1);
            assert_eq!(snap.circuit_state, CircuitState::Closed);
        }

        for _ in 0..4 {
            probe_all(&monitor, &registry).await;
        }
        assert_eq!(monitor.snapshot("refused").unwrap().circuit_state, CircuitState::Open);
        assert_eq!(monitor.snapshot("hung").unwrap().circuit_state, CircuitState::Open);
        assert!(!monitor.try_acquire("hung"));

        let alive = monitor.snapshot("alive").unwrap();
        assert_eq!(alive.circuit_state, CircuitState::Closed);
        assert_eq!(alive.last_probe_ok, Some(true));
        assert!(alive.last_probe_at.is_some());
        assert!(alive.p50_latency_ms.is_some());
        // 探活成功只刷新存活信息，不计入窗口
        assert_eq!(alive.window_successes, 0);
        assert_eq!(alive.total_successes, 0);
    }
}
