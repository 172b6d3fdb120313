use axum::http::HeaderMap;
use axum::{extract::State, Json};
use hearth_core::{Operation, QueueDocument};
use serde_json::{json, Value};

use super::{queue_edited, QueueView};
use crate::apply::{ApplyOptions, ApplyResult};
use crate::responses::{require_admin, ApiResult};
use crate::AppState;

/// Current queued change set, if any.
#[utoipa::path(
    get,
    path = "/queue",
    tag = "Queue",
    responses((status = 200, description = "Queued change set or null", body = serde_json::Value))
)]
pub async fn queue_get(State(state): State<AppState>) -> ApiResult<Json<QueueView>> {
    let queue = state.queue().load()?;
    Ok(Json(QueueView::new(&state, queue)))
}

/// Replace the queue with an operator-edited `{operations, master_config}` document.
#[utoipa::path(
    put,
    path = "/queue",
    tag = "Queue",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Saved queue", body = serde_json::Value),
        (status = 400, description = "Invalid document", body = serde_json::Value),
        (status = 401, description = "Unauthorized", body = serde_json::Value)
    )
)]
pub async fn queue_put(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(doc): Json<QueueDocument>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let queue = state.queue().save_document(state.store(), doc)?;
    Ok(Json(queue_edited(&state, queue)))
}

/// Discard the queue.
#[utoipa::path(
    delete,
    path = "/queue",
    tag = "Queue",
    responses(
        (status = 200, description = "Queue discarded", body = serde_json::Value),
        (status = 401, description = "Unauthorized", body = serde_json::Value)
    )
)]
pub async fn queue_delete(headers: HeaderMap, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let deleted = state.queue().delete()?;
    if deleted {
        queue_edited(&state, None);
    }
    Ok(Json(json!({"deleted": deleted})))
}

/// Run the queued operations.
#[utoipa::path(
    post,
    path = "/queue/apply",
    tag = "Queue",
    responses(
        (status = 200, description = "Apply finished", body = ApplyResult),
        (status = 404, description = "Nothing queued", body = serde_json::Value),
        (status = 409, description = "Apply already running", body = serde_json::Value)
    )
)]
pub async fn queue_apply(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Json<ApplyResult>> {
    require_admin(&headers)?;
    let result = state.apply().apply_queued(ApplyOptions::default()).await?;
    Ok(Json(result))
}

/// Drop one operation and revert the fields it covered.
#[utoipa::path(
    post,
    path = "/queue/remove",
    tag = "Queue",
    request_body = serde_json::Value,
    responses(
        (status = 200, description = "Updated queue", body = serde_json::Value),
        (status = 404, description = "Operation not queued", body = serde_json::Value)
    )
)]
pub async fn queue_remove_operation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(op): Json<Operation>,
) -> ApiResult<Json<QueueView>> {
    require_admin(&headers)?;
    let _edit = state.apply().edit_guard().await;
    let queue = state.queue().remove_operation(state.store(), &op)?;
    Ok(Json(queue_edited(&state, queue)))
}
