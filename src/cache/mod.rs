//! Response Cache: fingerprint → response, expiring strictly by TTL.
//!
//! The fingerprint covers prompt, system prompt, temperature and resolved model
//! only. `conversation_id` is left out on purpose so identical prompts from
//! different conversations share one entry.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::types::CompletionResponse;

const FINGERPRINT_DOMAIN: &[u8] = b"llm-gateway/response-cache/v1";

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Hex SHA-256 over the stable request fields. Each field is length-prefixed
/// so adjacent fields cannot bleed into each other.
pub fn fingerprint(prompt: &str, system_prompt: Option<&str>, temperature: f32, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_DOMAIN);
    write_field(&mut hasher, prompt.as_bytes());
    match system_prompt {
        Some(system) => {
            hasher.update([1u8]);
            write_field(&mut hasher, system.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    // -0.0 与 0.0 视为同一温度
    let temperature = if temperature == 0.0 { 0.0f32 } else { temperature };
    hasher.update(temperature.to_bits().to_be_bytes());
    write_field(&mut hasher, model.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: CompletionResponse,
    pub inserted_at: Instant,
    pub inserted_wall: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub ttl_secs: u64,
}

pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    enabled: bool,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            enabled: config.enabled && config.ttl_secs > 0,
            ttl: config.ttl(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &str) -> Option<CompletionResponse> {
        self.get_first([key])
    }

    /// Return the first live entry among `keys`, in order. One call counts as a
    /// single hit or miss however many keys it inspects.
    pub fn get_first<I, S>(&self, keys: I) -> Option<CompletionResponse>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.enabled {
            return None;
        }
        let now = Instant::now();
        for key in keys {
            if let Some(response) = self.lookup(key.as_ref(), now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(response);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<CompletionResponse> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.response.clone()),
            Some(_) => true,
            None => false,
        };
        // 读锁已在 match 结束时释放，此处再取写锁不会自锁
        if expired {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        None
    }

    /// Store `response` under `key`. A racing insert of the same key simply
    /// supersedes the earlier one.
    pub fn insert(&self, key: String, response: CompletionResponse) {
        if !self.enabled {
            return;
        }
        let entry = CacheEntry {
            fingerprint: key.clone(),
            response,
            inserted_at: Instant::now(),
            inserted_wall: Utc::now(),
            ttl: self.ttl,
        };
        self.entries.insert(key, entry);
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            enabled: self.enabled,
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

pub fn spawn_sweeper(cache: Arc<ResponseCache>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, "Swept expired cache entries");
            }
        }
    })
}
