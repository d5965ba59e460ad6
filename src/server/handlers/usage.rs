use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::Json;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::server::AppState;
use crate::usage::{UsageQuery, UsageStats};

pub async fn usage_stats(
    State(app_state): State<Arc<AppState>>,
    query: Result<Query<UsageQuery>, QueryRejection>,
) -> Result<Json<UsageStats>, GatewayError> {
    let Query(query) = query.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    if let (Some(since), Some(until)) = (query.since, query.until) {
        if since > until {
            return Err(GatewayError::InvalidRequest(
                "'since' must not be later than 'until'".into(),
            ));
        }
    }
    Ok(Json(app_state.gateway.usage().stats(&query)))
}
