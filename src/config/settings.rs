use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    /// 数组顺序即注册顺序，路由打平时依此决胜
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: AdapterKind,
    #[serde(default)]
    pub family: Option<ProviderFamily>,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 从环境变量读取密钥（可配合 .env）
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default = "default_quality_rank")]
    pub quality_rank: u8,
}

fn default_quality_rank() -> u8 {
    5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    OpenAI,
    Anthropic,
    Ollama,
}

impl AdapterKind {
    pub fn default_family(&self) -> ProviderFamily {
        match self {
            Self::OpenAI | Self::Anthropic => ProviderFamily::Hosted,
            Self::Ollama => ProviderFamily::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFamily {
    Hosted,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 调用方等待上限；超时返回 504，已发出的上游调用继续在后台完成
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            request_timeout_ms: 120_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub attempt_timeout_ms: u64,
    pub default_temperature: f32,
    pub default_expected_output_tokens: u32,
    pub realtime_latency_ms: u64,
    pub standard_latency_ms: u64,
    pub rate_limit_penalty_weight: f64,
    pub half_open_penalty_weight: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 30_000,
            default_temperature: 0.7,
            default_expected_output_tokens: 256,
            realtime_latency_ms: 2_000,
            standard_latency_ms: 10_000,
            rate_limit_penalty_weight: 1.0,
            half_open_penalty_weight: 0.5,
        }
    }
}

impl RoutingConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub window_size: usize,
    pub min_samples: usize,
    pub failure_threshold: f64,
    /// 连续失败次数达到该值即熔断；0 表示只看失败率
    pub consecutive_failure_threshold: u32,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub backoff_multiplier: f64,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub latency_samples: usize,
    pub rate_limit_penalty_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            min_samples: 5,
            failure_threshold: 0.5,
            consecutive_failure_threshold: 5,
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            backoff_multiplier: 2.0,
            probe_interval_ms: 15_000,
            probe_timeout_ms: 5_000,
            latency_samples: 100,
            rate_limit_penalty_ms: 10_000,
        }
    }
}

impl HealthConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms.max(self.cooldown_ms))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rate_limit_penalty(&self) -> Duration {
        Duration::from_millis(self.rate_limit_penalty_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3_600,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// 未配置时账本只保存在内存中
    pub database_path: Option<String>,
    /// Most recent records kept in memory for windowed queries. Lifetime
    /// totals stay exact regardless of this cap.
    pub retained_records: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            retained_records: 100_000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let config_path = Self::find_config_file()?;
        let config_content = std::fs::read_to_string(&config_path)?;
        let settings = Self::from_toml(&config_content)?;
        tracing::info!(
            path = %config_path,
            providers = settings.providers.len(),
            "Loaded gateway configuration"
        );
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn find_config_file() -> Result<String> {
        if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
            if Path::new(&path).exists() {
                return Ok(path);
            }
            return Err(GatewayError::Config(format!(
                "GATEWAY_CONFIG points to missing file: {}",
                path
            )));
        }

        let possible_names = ["custom-config.toml", "config.toml"];
        for name in &possible_names {
            if Path::new(name).exists() {
                return Ok(name.to_string());
            }
        }

        Err(GatewayError::Config(
            "Configuration file not found. Please create custom-config.toml or config.toml".into(),
        ))
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(GatewayError::Config("at least one provider is required".into()));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(GatewayError::Config("provider name cannot be empty".into()));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(GatewayError::Config(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
            for model in &provider.models {
                if model.id.trim().is_empty() {
                    return Err(GatewayError::Config(format!(
                        "provider '{}' has a model with an empty id",
                        provider.name
                    )));
                }
                let costs = [model.input_cost_per_token, model.output_cost_per_token];
                if costs.iter().any(|c| !c.is_finite() || *c < 0.0) {
                    return Err(GatewayError::Config(format!(
                        "model '{}/{}' has an invalid cost",
                        provider.name, model.id
                    )));
                }
                if !(1..=10).contains(&model.quality_rank) {
                    return Err(GatewayError::Config(format!(
                        "model '{}/{}' quality_rank must be within 1..=10",
                        provider.name, model.id
                    )));
                }
            }
        }

        let h = &self.health;
        // 熔断条件是“失败率超过阈值”，阈值取 1 将永远无法熔断
        if !(h.failure_threshold > 0.0 && h.failure_threshold < 1.0) {
            return Err(GatewayError::Config(
                "health.failure_threshold must be within (0, 1)".into(),
            ));
        }
        if h.min_samples == 0 || h.window_size < h.min_samples {
            return Err(GatewayError::Config(
                "health.window_size must be >= health.min_samples >= 1".into(),
            ));
        }
        if h.probe_interval_ms == 0 {
            return Err(GatewayError::Config(
                "health.probe_interval_ms must be positive".into(),
            ));
        }
        if h.backoff_multiplier < 1.0 {
            return Err(GatewayError::Config(
                "health.backoff_multiplier must be >= 1".into(),
            ));
        }

        Ok(())
    }
}

impl ProviderConfig {
    pub fn family(&self) -> ProviderFamily {
        self.family.unwrap_or_else(|| self.kind.default_family())
    }

    /// 解析密钥：显式配置优先，其次读取环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [server]
        port = 9000

        [health]
        window_size = 8
        min_samples = 4

        [[providers]]
        name = "openai"
        kind = "openai"
        base_url = "https://api.openai.com"
        api_key_env = "OPENAI_API_KEY"

        [[providers.models]]
        id = "gpt-3.5-turbo"
        output_cost_per_token = 0.000002
        quality_rank = 6

        [[providers]]
        name = "local"
        kind = "ollama"
        base_url = "http://127.0.0.1:11434"

        [[providers.models]]
        id = "llama3"
    "#;

    #[test]
    fn parses_providers_in_declared_order_with_defaults() {
        let settings = Settings::from_toml(SAMPLE).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.health.window_size, 8);
        assert_eq!(settings.health.cooldown_ms, 30_000);
        assert!(settings.cache.enabled);

        let names: Vec<_> = settings.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["openai", "local"]);
        assert_eq!(settings.providers[0].family(), ProviderFamily::Hosted);
        assert_eq!(settings.providers[1].family(), ProviderFamily::Local);
        assert_eq!(settings.providers[1].models[0].quality_rank, 5);
        assert_eq!(settings.providers[1].models[0].output_cost_per_token, 0.0);
    }

    #[test]
    fn rejects_duplicate_provider_names() {
        let doc = r#"
            [[providers]]
            name = "a"
            kind = "openai"
            base_url = "http://x"
            [[providers]]
            name = "a"
            kind = "ollama"
            base_url = "http://y"
        "#;
        let err = Settings::from_toml(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate provider"));
    }

    #[test]
    fn rejects_out_of_range_quality_rank_and_empty_registry() {
        let doc = r#"
            [[providers]]
            name = "a"
            kind = "openai"
            base_url = "http://x"
            [[providers.models]]
            id = "m"
            quality_rank = 11
        "#;
        assert!(Settings::from_toml(doc).is_err());
        assert!(Settings::from_toml("providers = []").is_err());
    }

    #[test]
    fn explicit_api_key_wins_over_env_reference() {
        let provider = ProviderConfig {
            name: "p".into(),
            kind: AdapterKind::OpenAI,
            family: None,
            base_url: "http://x".into(),
            api_key: Some("sk-inline".into()),
            api_key_env: Some("LLM_GATEWAY_TEST_UNSET_VAR".into()),
            models: vec![],
        };
        assert_eq!(provider.resolve_api_key().as_deref(), Some("sk-inline"));

        let provider = ProviderConfig { api_key: None, ..provider };
        assert_eq!(provider.resolve_api_key(), None);
    }
}
