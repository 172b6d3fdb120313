use axum::{extract::State, Json};
use hearth_runtime::ServiceState;
use serde::Serialize;
use utoipa::ToSchema;

use crate::responses::ApiResult;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
pub struct Healthz {
    pub ok: bool,
    /// Every enabled service reports `running`.
    pub all_running: bool,
    pub services: usize,
    pub running: usize,
    pub failed: usize,
}

/// Liveness plus an aggregate of supervised service health.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Health",
    responses((status = 200, description = "Hub is up", body = Healthz))
)]
pub async fn healthz(State(state): State<AppState>) -> ApiResult<Json<Healthz>> {
    let snapshot = state.supervisor().snapshot().await?;
    Ok(Json(Healthz {
        ok: true,
        all_running: snapshot.all_enabled_running(),
        services: snapshot.services.len(),
        running: snapshot.count(ServiceState::Running),
        failed: snapshot.count(ServiceState::Failed),
    }))
}
