use axum::extract::Path;
use axum::http::HeaderMap;
use axum::{extract::State, Json};
use hearth_core::{ExtensionPatch, InstalledExtensionRecord, MasterConfig, PortAssignment, ToolPatch};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{queue_edited, QueueView};
use crate::responses::{require_admin, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CoreUpdateRequest {
    /// `null` withdraws a pending update.
    #[serde(default)]
    pub version: Option<String>,
}

fn patched(state: &AppState, subject: &str, queue: Option<hearth_core::QueuedChangeSet>) -> QueueView {
    info!(target: "hearth::api", subject, queued = queue.is_some(), "config patched");
    state
        .bus()
        .publish(hearth_topics::TOPIC_CONFIG_PATCHED, &json!({"subject": subject}));
    queue_edited(state, queue)
}

/// The applied baseline.
#[utoipa::path(
    get,
    path = "/config",
    tag = "Config",
    responses((status = 200, description = "Applied master config", body = serde_json::Value))
)]
pub async fn config_get(State(state): State<AppState>) -> ApiResult<Json<MasterConfig>> {
    Ok(Json(state.store().load()?))
}

/// Every persisted port assignment, by scope.
#[utoipa::path(
    get,
    path = "/ports",
    tag = "Config",
    responses((status = 200, description = "Port assignments", body = serde_json::Value))
)]
pub async fn ports_list(State(state): State<AppState>) -> ApiResult<Json<Vec<PortAssignment>>> {
    Ok(Json(state.ports().assignments()?))
}

/// Extensions found on disk.
#[utoipa::path(
    get,
    path = "/extensions",
    tag = "Config",
    responses((status = 200, description = "Installed extensions", body = serde_json::Value))
)]
pub async fn extensions_installed(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<InstalledExtensionRecord>>> {
    Ok(Json(state.installer().installed()?))
}

/// Edit one extension's desired state; the queue is restaged.
#[utoipa::path(
    patch,
    path = "/config/extensions/{name}",
    tag = "Config",
    params(("name" = String, Path, description = "Extension name")),
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Updated queue", body = serde_json::Value),
        (status = 400, description = "Validation failed", body = serde_json::Value)
    )
)]
pub async fn extension_patch(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ExtensionPatch>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let installed = state.installer().installed()?;
    let queue = state
        .store()
        .patch_extension(state.queue(), &installed, &name, Some(patch))?;
    Ok(Json(patched(&state, &name, queue)))
}

/// Remove an extension from the desired state.
#[utoipa::path(
    delete,
    path = "/config/extensions/{name}",
    tag = "Config",
    params(("name" = String, Path, description = "Extension name")),
    responses((status = 200, description = "Updated queue", body = serde_json::Value))
)]
pub async fn extension_remove(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let installed = state.installer().installed()?;
    let queue = state
        .store()
        .patch_extension(state.queue(), &installed, &name, None)?;
    Ok(Json(patched(&state, &name, queue)))
}

/// Edit one tool's MCP exposure.
#[utoipa::path(
    patch,
    path = "/config/tools/{name}",
    tag = "Config",
    params(("name" = String, Path, description = "Tool name")),
    request_body = serde_json::Value,
    responses((status = 200, description = "Updated queue", body = serde_json::Value))
)]
pub async fn tool_patch(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(patch): Json<ToolPatch>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let installed = state.installer().installed()?;
    let queue = state
        .store()
        .patch_tool(state.queue(), &installed, &name, Some(patch))?;
    Ok(Json(patched(&state, &name, queue)))
}

#[utoipa::path(
    delete,
    path = "/config/tools/{name}",
    tag = "Config",
    params(("name" = String, Path, description = "Tool name")),
    responses((status = 200, description = "Updated queue", body = serde_json::Value))
)]
pub async fn tool_remove(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let installed = state.installer().installed()?;
    let queue = state
        .store()
        .patch_tool(state.queue(), &installed, &name, None)?;
    Ok(Json(patched(&state, &name, queue)))
}

/// Queue or withdraw a core version update.
#[utoipa::path(
    put,
    path = "/config/core/update",
    tag = "Config",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Updated queue", body = serde_json::Value),
        (status = 400, description = "Not a semver version", body = serde_json::Value)
    )
)]
pub async fn core_update(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CoreUpdateRequest>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let installed = state.installer().installed()?;
    let queue = state
        .store()
        .patch_core_update(state.queue(), &installed, req.version)?;
    Ok(Json(patched(&state, "core", queue)))
}
