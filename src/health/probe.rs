use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::HealthMonitor;
use crate::error::FailureKind;
use crate::providers::{ProviderError, Registry};

/// Probe every provider once, concurrently, and fold the results in.
pub async fn probe_all(monitor: &HealthMonitor, registry: &Registry) {
    let timeout = monitor.config().probe_timeout();
    let probes = registry.iter().map(|descriptor| async move {
        let started = Instant::now();
        // 适配器自身也受时限约束，这里再兜底一层
        let result = match tokio::time::timeout(timeout, descriptor.adapter.probe(timeout)).await {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };
        (descriptor.name.as_str(), started.elapsed(), result)
    });

    for (name, elapsed, result) in join_all(probes).await {
        let folded: Result<_, FailureKind> = match result {
            Ok(()) => Ok(elapsed),
            Err(e) => {
                tracing::debug!(provider = %name, error = %e, "Probe failed");
                Err(e.kind())
            }
        };
        monitor.record_probe(name, folded);
    }
}

pub fn spawn_probe_loop(monitor: Arc<HealthMonitor>, registry: Arc<Registry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.config().probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            probe_all(&monitor, &registry).await;
        }
    })
}
