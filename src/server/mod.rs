pub mod handlers;

use axum::Router;
use axum::http::{Method, header};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Settings;
use crate::error::Result as AppResult;
use crate::gateway::Gateway;
use crate::providers::Registry;
use crate::usage::{SqliteUsageStore, UsageAccountant, UsageStore, spawn_writer};

#[derive(Clone)]
pub struct AppState {
    pub config: Settings,
    pub gateway: Gateway,
}

impl AppState {
    pub fn new(config: Settings, gateway: Gateway) -> Self {
        Self { config, gateway }
    }
}

/// Build the gateway from configuration and start its background tasks
/// (usage writer, probe loop, cache sweep). The returned handles are aborted on shutdown.
pub async fn build_state(config: Settings) -> AppResult<(AppState, Vec<JoinHandle<()>>)> {
    let registry = Arc::new(Registry::from_settings(&config)?);
    let mut handles = Vec::new();

    let retained = config.usage.retained_records;
    let usage = match &config.usage.database_path {
        Some(path) => {
            let store = Arc::new(SqliteUsageStore::open(path).await?);
            let history = store.load_history(retained).await?;
            tracing::info!(
                lifetime = history.lifetime.total.requests,
                retained = history.recent.len(),
                "Loaded usage ledger"
            );
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(spawn_writer(store, rx));
            UsageAccountant::with_retention(retained)
                .seeded(history)
                .with_sink(tx)
        }
        None => {
            tracing::info!("No usage database configured; ledger kept in memory");
            UsageAccountant::with_retention(retained)
        }
    };

    let gateway = Gateway::new(&config, registry, Arc::new(usage));
    handles.extend(gateway.spawn_background());

    Ok((AppState::new(config, gateway), handles))
}

pub fn create_app(state: AppState) -> Router {
    // CORS（便于前端联调；生产环境应收敛来源）
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    handlers::routes()
        .with_state(Arc::new(state))
        .layer(ServiceBuilder::new().layer(cors))
}
