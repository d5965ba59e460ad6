use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::cache::CacheStats;
use crate::server::AppState;

pub async fn cache_stats(State(app_state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(app_state.gateway.cache().stats())
}

pub async fn clear_cache(State(app_state): State<Arc<AppState>>) -> Json<Value> {
    let cleared = app_state.gateway.cache().clear();
    tracing::info!(cleared, "Response cache purged");
    Json(json!({ "cleared": cleared }))
}
