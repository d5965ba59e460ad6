//! Usage Accountant: append-only ledger of real (non-cached) exchanges.
//!
//! Lifetime totals are kept as running sums, so unfiltered stats stay exact
//! for the life of the process. Only the most recent records are retained
//! in memory for windowed or per-provider queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

use crate::providers::ModelPricing;

mod store;

pub use store::{BoxFuture, SqliteUsageStore, UsageHistory, UsageStore, spawn_writer};

pub const DEFAULT_RETAINED_RECORDS: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Filter for aggregate reads. The window is half-open: `[since, until)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub provider: Option<String>,
}

impl UsageQuery {
    fn is_unfiltered(&self) -> bool {
        self.since.is_none() && self.until.is_none() && self.provider.is_none()
    }

    fn matches(&self, record: &UsageRecord) -> bool {
        self.since.is_none_or(|since| record.timestamp >= since)
            && self.until.is_none_or(|until| record.timestamp < until)
            && self
                .provider
                .as_deref()
                .is_none_or(|provider| record.provider == provider)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
}

impl Totals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        self.prompt_tokens += u64::from(record.prompt_tokens);
        self.completion_tokens += u64::from(record.completion_tokens);
        self.total_tokens += u64::from(record.total_tokens);
        self.cost += record.cost;
    }

    fn merge(&mut self, other: &Totals) {
        self.requests += other.requests;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub total: Totals,
    pub by_provider: BTreeMap<String, Totals>,
    pub by_model: BTreeMap<String, Totals>,
    /// Oldest in-memory record when the answer came from the retained window.
    /// Filtered queries reaching further back than this only see part of the
    /// history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retained_since: Option<DateTime<Utc>>,
}

impl UsageStats {
    fn add(&mut self, record: &UsageRecord) {
        self.total.add(record);
        self.by_provider
            .entry(record.provider.clone())
            .or_default()
            .add(record);
        self.by_model
            .entry(record.model.clone())
            .or_default()
            .add(record);
    }

    /// Fold a pre-aggregated `(provider, model)` bucket into the stats.
    pub fn merge_bucket(&mut self, provider: &str, model: &str, totals: &Totals) {
        self.total.merge(totals);
        self.by_provider
            .entry(provider.to_string())
            .or_default()
            .merge(totals);
        self.by_model
            .entry(model.to_string())
            .or_default()
            .merge(totals);
    }
}

struct Ledger {
    recent: VecDeque<UsageRecord>,
    capacity: usize,
    lifetime: UsageStats,
}

impl Ledger {
    fn push(&mut self, record: UsageRecord) {
        self.lifetime.add(&record);
        if self.capacity == 0 {
            return;
        }
        // 超出保留上限时丢弃最旧记录，累计值不受影响
        while self.recent.len() >= self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(record);
    }
}

pub struct UsageAccountant {
    ledger: RwLock<Ledger>,
    // 持久化通道：发送即返回，不等待写盘
    sink: Option<UnboundedSender<UsageRecord>>,
}

impl UsageAccountant {
    /// In-memory only ledger with the default retention.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RECORDS)
    }

    /// In-memory ledger keeping at most `capacity` recent records.
    pub fn with_retention(capacity: usize) -> Self {
        Self {
            ledger: RwLock::new(Ledger {
                recent: VecDeque::new(),
                capacity,
                lifetime: UsageStats::default(),
            }),
            sink: None,
        }
    }

    /// Seed lifetime totals and the recent window from persisted history.
    pub fn seeded(self, history: UsageHistory) -> Self {
        {
            let mut ledger = self.ledger.write().unwrap_or_else(|e| e.into_inner());
            ledger.lifetime = history.lifetime;
            let skip = history.recent.len().saturating_sub(ledger.capacity);
            ledger.recent = history.recent.into_iter().skip(skip).collect();
        }
        self
    }

    /// Forward every new record to a background writer as well.
    pub fn with_sink(mut self, sink: UnboundedSender<UsageRecord>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Price one completed exchange and append it to the ledger.
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        pricing: ModelPricing,
    ) -> UsageRecord {
        let record = UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            cost: pricing.cost_for(prompt_tokens, completion_tokens),
            timestamp: Utc::now(),
        };
        self.append(record.clone());
        record
    }

    pub fn append(&self, record: UsageRecord) {
        if let Some(sink) = &self.sink {
            if sink.send(record.clone()).is_err() {
                tracing::warn!(provider = %record.provider, "Usage writer is gone; record kept in memory only");
            }
        }
        self.ledger
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    /// Number of exchanges recorded over the ledger's lifetime.
    pub fn len(&self) -> usize {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        ledger.lifetime.total.requests as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records currently held in the in-memory window.
    pub fn retained(&self) -> usize {
        self.ledger
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .recent
            .len()
    }

    pub fn stats(&self, query: &UsageQuery) -> UsageStats {
        let ledger = self.ledger.read().unwrap_or_else(|e| e.into_inner());
        if query.is_unfiltered() {
            return ledger.lifetime.clone();
        }
        let mut stats = UsageStats {
            retained_since: ledger.recent.front().map(|r| r.timestamp),
            ..UsageStats::default()
        };
        for record in ledger.recent.iter().filter(|r| query.matches(r)) {
            stats.add(record);
        }
        stats
    }
}

impl Default for UsageAccountant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;

    fn pricing(input: f64, output: f64) -> ModelPricing {
        ModelPricing {
            input_cost_per_token: input,
            output_cost_per_token: output,
        }
    }

    #[test]
    fn cost_is_tokens_times_price() {
        let accountant = UsageAccountant::new();
        let record = accountant.record("openai", "gpt-3.5-turbo", 0, 8, pricing(0.0, 0.000002));
        assert_eq!(record.cost, 0.000016);
        assert_eq!(record.total_tokens, 8);
        assert_eq!(accountant.len(), 1);
    }

    #[test]
    fn aggregates_by_provider_and_model() {
        let accountant = UsageAccountant::new();
        accountant.record("openai", "gpt-4", 10, 5, pricing(0.01, 0.02));
        accountant.record("openai", "gpt-3.5-turbo", 4, 4, pricing(0.0, 0.0));
        accountant.record("local", "llama3", 7, 3, pricing(0.0, 0.0));

        let stats = accountant.stats(&UsageQuery::default());
        assert_eq!(stats.total.requests, 3);
        assert_eq!(stats.total.total_tokens, 33);
        assert_eq!(stats.by_provider["openai"].requests, 2);
        assert_eq!(stats.by_provider["local"].prompt_tokens, 7);
        assert_eq!(stats.by_model["gpt-4"].completion_tokens, 5);
        assert!((stats.by_provider["openai"].cost - 0.2).abs() < 1e-12);

        let only_local = accountant.stats(&UsageQuery {
            provider: Some("local".into()),
            ..UsageQuery::default()
        });
        assert_eq!(only_local.total.requests, 1);
        assert!(!only_local.by_provider.contains_key("openai"));
    }

    #[test]
    fn time_window_is_half_open() {
        let accountant = UsageAccountant::new();
        let t0 = Utc::now();
        for (offset, provider) in [(0, "a"), (10, "b"), (20, "c")] {
            accountant.append(UsageRecord {
                provider: provider.into(),
                model: "m".into(),
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                cost: 0.0,
                timestamp: t0 + ChronoDuration::seconds(offset),
            });
        }

        let stats = accountant.stats(&UsageQuery {
            since: Some(t0 + ChronoDuration::seconds(10)),
            until: Some(t0 + ChronoDuration::seconds(20)),
            provider: None,
        });
        assert_eq!(stats.total.requests, 1);
        assert!(stats.by_provider.contains_key("b"));
    }

    #[test]
    fn retention_caps_window_but_lifetime_totals_stay_exact() {
        let accountant = UsageAccountant::with_retention(3);
        for i in 0..10u32 {
            accountant.record(if i % 2 == 0 { "even" } else { "odd" }, "m", i, 1, pricing(0.0, 0.0));
        }

        assert_eq!(accountant.len(), 10);
        assert_eq!(accountant.retained(), 3);

        let lifetime = accountant.stats(&UsageQuery::default());
        assert_eq!(lifetime.total.requests, 10);
        assert_eq!(lifetime.total.prompt_tokens, 45);
        assert_eq!(lifetime.by_provider["even"].requests, 5);
        assert!(lifetime.retained_since.is_none());

        // 仅保留最后三条：7(odd) 8(even) 9(odd)
        let odd = accountant.stats(&UsageQuery {
            provider: Some("odd".into()),
            ..UsageQuery::default()
        });
        assert_eq!(odd.total.requests, 2);
        assert_eq!(odd.total.prompt_tokens, 16);
        assert!(odd.retained_since.is_some());
    }

    #[test]
    fn seeding_keeps_lifetime_and_trims_recent_to_capacity() {
        let mut lifetime = UsageStats::default();
        lifetime.merge_bucket(
            "openai",
            "gpt-4",
            &Totals {
                requests: 500,
                prompt_tokens: 1_000,
                completion_tokens: 2_000,
                total_tokens: 3_000,
                cost: 1.5,
            },
        );
        let t0 = Utc::now() - ChronoDuration::seconds(60);
        let recent = (0..5)
            .map(|i| UsageRecord {
                provider: "openai".into(),
                model: "gpt-4".into(),
                prompt_tokens: 2,
                completion_tokens: 4,
                total_tokens: 6,
                cost: 0.003,
                timestamp: t0 + ChronoDuration::seconds(i),
            })
            .collect();

        let accountant = UsageAccountant::with_retention(2).seeded(UsageHistory { lifetime, recent });
        assert_eq!(accountant.len(), 500);
        assert_eq!(accountant.retained(), 2);

        accountant.record("local", "llama3", 1, 1, pricing(0.0, 0.0));
        let stats = accountant.stats(&UsageQuery::default());
        assert_eq!(stats.total.requests, 501);
        assert_eq!(stats.by_model["gpt-4"].total_tokens, 3_000);
        assert_eq!(stats.by_provider["local"].requests, 1);

        let windowed = accountant.stats(&UsageQuery {
            since: Some(t0 + ChronoDuration::seconds(4)),
            ..UsageQuery::default()
        });
        assert_eq!(windowed.total.requests, 2);
        assert_eq!(windowed.retained_since, Some(t0 + ChronoDuration::seconds(4)));
    }

    #[tokio::test]
    async fn records_are_forwarded_to_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let accountant = UsageAccountant::new().with_sink(tx);
        accountant.record("p", "m", 1, 2, pricing(0.0, 0.0));

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.provider, "p");
        assert_eq!(forwarded.total_tokens, 3);
    }

    #[test]
    fn closed_sink_does_not_lose_in_memory_record() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let accountant = UsageAccountant::new().with_sink(tx);
        accountant.record("p", "m", 1, 1, pricing(0.0, 0.0));
        assert_eq!(accountant.len(), 1);
    }
}
