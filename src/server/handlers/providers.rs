use axum::extract::State;
use axum::response::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::config::ProviderFamily;
use crate::health::HealthSnapshot;
use crate::providers::ModelSpec;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub family: ProviderFamily,
    pub models: Vec<ModelSpec>,
    #[serde(flatten)]
    pub health: HealthSnapshot,
}

pub async fn providers_status(State(app_state): State<Arc<AppState>>) -> Json<Vec<ProviderStatus>> {
    let gateway = &app_state.gateway;
    let statuses = gateway
        .health()
        .snapshot_all()
        .into_iter()
        .filter_map(|snapshot| {
            let descriptor = gateway.registry().get(&snapshot.provider)?;
            Some(ProviderStatus {
                family: descriptor.family,
                models: descriptor.models.clone(),
                health: snapshot,
            })
        })
        .collect();
    Json(statuses)
}
