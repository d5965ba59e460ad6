use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;

use crate::server::AppState;

mod cache;
mod complete;
mod health;
mod providers;
mod usage;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/complete", post(complete::complete))
        .route("/health", get(health::health))
        .route("/providers/status", get(providers::providers_status))
        .route("/usage/stats", get(usage::usage_stats))
        .route("/cache/stats", get(cache::cache_stats))
        .route("/cache", delete(cache::clear_cache))
}
