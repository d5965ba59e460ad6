pub mod settings;

pub use settings::{
    AdapterKind, CacheConfig, HealthConfig, ModelConfig, ProviderConfig, ProviderFamily,
    RoutingConfig, ServerConfig, Settings, UsageConfig,
};
