use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};

use crate::responses::{problem_response, require_admin, ApiResult};
use crate::restart::{RestartChoice, RestartJob};
use crate::AppState;

/// Start the full-system restart job.
#[utoipa::path(
    post,
    path = "/system/restart",
    tag = "System",
    responses(
        (status = 202, description = "Restart started", body = RestartJob),
        (status = 409, description = "Restart already running", body = serde_json::Value)
    )
)]
pub async fn restart_begin(headers: HeaderMap, State(state): State<AppState>) -> ApiResult<Response> {
    require_admin(&headers)?;
    let job = state.restart().begin()?;
    Ok((StatusCode::ACCEPTED, Json(job)).into_response())
}

/// The current (or last finished) restart job.
#[utoipa::path(
    get,
    path = "/system/restart",
    tag = "System",
    responses(
        (status = 200, description = "Restart job", body = RestartJob),
        (status = 404, description = "No restart has run", body = serde_json::Value)
    )
)]
pub async fn restart_status(State(state): State<AppState>) -> Response {
    match state.restart().current() {
        Some(job) => Json(job).into_response(),
        None => problem_response(StatusCode::NOT_FOUND, "Not Found", Some("no restart job")),
    }
}

async fn choose(headers: HeaderMap, state: AppState, choice: RestartChoice) -> ApiResult<Json<RestartJob>> {
    require_admin(&headers)?;
    Ok(Json(state.restart().choose(choice)?))
}

/// Extend the health wait after a timeout.
#[utoipa::path(
    post,
    path = "/system/restart/keep-waiting",
    tag = "System",
    responses(
        (status = 200, description = "Choice accepted", body = RestartJob),
        (status = 409, description = "Job is not waiting for a decision", body = serde_json::Value)
    )
)]
pub async fn restart_keep_waiting(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Json<RestartJob>> {
    choose(headers, state, RestartChoice::KeepWaiting).await
}

/// Give up waiting and finish the job as forced.
#[utoipa::path(
    post,
    path = "/system/restart/force-reload",
    tag = "System",
    responses(
        (status = 200, description = "Choice accepted", body = RestartJob),
        (status = 409, description = "Job is not waiting for a decision", body = serde_json::Value)
    )
)]
pub async fn restart_force_reload(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Json<RestartJob>> {
    choose(headers, state, RestartChoice::ForceReload).await
}
