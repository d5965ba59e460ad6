use axum::extract::State;
use axum::response::Json;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::server::AppState;

/// Liveness of the gateway process itself, not of any provider.
pub async fn health(State(app_state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": app_state.gateway.registry().len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
