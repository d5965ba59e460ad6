use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Json;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::server::AppState;
use crate::types::{CompletionRequest, CompletionResponse};

pub async fn complete(
    State(app_state): State<Arc<AppState>>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Json<CompletionResponse>, GatewayError> {
    let request_id = Uuid::new_v4();
    let started = Instant::now();

    // 请求体解析失败统一映射为 InvalidRequest
    let Json(request) = payload.map_err(|rejection| {
        tracing::info!(%request_id, error = %rejection.body_text(), "Rejected malformed completion body");
        GatewayError::InvalidRequest(rejection.body_text())
    })?;

    let result = app_state.gateway.complete(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(response) => tracing::info!(
            %request_id,
            method = "POST",
            path = "/v1/complete",
            status = 200u16,
            provider = %response.provider,
            model = %response.model_used,
            cache_hit = response.metadata.cache_hit,
            elapsed_ms,
            "Completion request finished"
        ),
        Err(e) => tracing::info!(
            %request_id,
            method = "POST",
            path = "/v1/complete",
            status = e.status_code().as_u16(),
            error_type = e.error_type(),
            elapsed_ms,
            "Completion request failed"
        ),
    }
    result.map(Json)
}
