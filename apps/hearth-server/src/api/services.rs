use std::convert::Infallible;

use axum::extract::{Path, Query};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{extract::State, Json};
use futures_util::stream::Stream;
use hearth_runtime::{ServiceRecord, SupervisorSnapshot};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tracing::info;

use crate::logs::{LogLine, LogTail};
use crate::responses::{require_admin, ApiResult};
use crate::AppState;

const DEFAULT_TAIL: usize = 200;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub after: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Aggregate status of every supervised service.
#[utoipa::path(
    get,
    path = "/services",
    tag = "Services",
    responses((status = 200, description = "Supervisor snapshot", body = serde_json::Value))
)]
pub async fn services_list(State(state): State<AppState>) -> ApiResult<Json<SupervisorSnapshot>> {
    Ok(Json(state.supervisor().snapshot().await?))
}

#[utoipa::path(
    get,
    path = "/services/{id}",
    tag = "Services",
    params(("id" = String, Path, description = "Service id")),
    responses(
        (status = 200, description = "Service record", body = serde_json::Value),
        (status = 404, description = "Unknown service", body = serde_json::Value)
    )
)]
pub async fn service_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    Ok(Json(state.supervisor().get(&id).await?))
}

#[utoipa::path(
    post,
    path = "/services/{id}/start",
    tag = "Services",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Service record", body = serde_json::Value))
)]
pub async fn service_start(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    require_admin(&headers)?;
    info!(target: "hearth::api", service = %id, "operator start");
    Ok(Json(state.supervisor().start(&id).await?))
}

/// Stop gracefully; replies once the process is gone.
#[utoipa::path(
    post,
    path = "/services/{id}/stop",
    tag = "Services",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Service record", body = serde_json::Value))
)]
pub async fn service_stop(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    require_admin(&headers)?;
    info!(target: "hearth::api", service = %id, "operator stop");
    Ok(Json(state.supervisor().stop(&id).await?))
}

#[utoipa::path(
    post,
    path = "/services/{id}/restart",
    tag = "Services",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Service record", body = serde_json::Value))
)]
pub async fn service_restart(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    require_admin(&headers)?;
    info!(target: "hearth::api", service = %id, "operator restart");
    Ok(Json(state.supervisor().restart(&id).await?))
}

/// Clear a `failed` service and its restart budget.
#[utoipa::path(
    post,
    path = "/services/{id}/reset",
    tag = "Services",
    params(("id" = String, Path, description = "Service id")),
    responses((status = 200, description = "Service record", body = serde_json::Value))
)]
pub async fn service_reset(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ServiceRecord>> {
    require_admin(&headers)?;
    info!(target: "hearth::api", service = %id, "operator reset");
    Ok(Json(state.supervisor().reset(&id).await?))
}

/// Recent output lines; pass the returned cursor as `after` to page forward.
#[utoipa::path(
    get,
    path = "/services/{id}/logs",
    tag = "Services",
    params(
        ("id" = String, Path, description = "Service id"),
        ("after" = Option<u64>, Query, description = "Only lines after this cursor"),
        ("limit" = Option<usize>, Query, description = "Maximum lines returned")
    ),
    responses((status = 200, description = "Log lines", body = LogTail))
)]
pub async fn service_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
) -> ApiResult<Json<LogTail>> {
    state.supervisor().get(&id).await?;
    Ok(Json(state.logs().tail(
        &id,
        q.after.unwrap_or(0),
        q.limit.unwrap_or(DEFAULT_TAIL),
    )))
}

fn log_event(line: &LogLine) -> Event {
    Event::default()
        .event("log")
        .id(line.seq.to_string())
        .json_data(line)
        .unwrap_or_else(|_| Event::default().event("log").data(line.line.clone()))
}

/// Live log stream: the backlog after `after` first, then new lines.
#[utoipa::path(
    get,
    path = "/services/{id}/logs/stream",
    tag = "Services",
    params(
        ("id" = String, Path, description = "Service id"),
        ("after" = Option<u64>, Query, description = "Replay lines after this cursor")
    ),
    responses((status = 200, description = "SSE stream of log lines", content_type = "text/event-stream"))
)]
pub async fn service_logs_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.supervisor().get(&id).await?;
    // Subscribe before reading the backlog so nothing falls between the two.
    let rx = state.logs().subscribe();
    let backlog = state
        .logs()
        .tail(&id, q.after.unwrap_or(0), q.limit.unwrap_or(DEFAULT_TAIL));
    let last_seen = backlog.cursor;
    let replay = tokio_stream::iter(
        backlog
            .lines
            .into_iter()
            .map(|line| Ok::<_, Infallible>(log_event(&line))),
    );
    let live = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(entry) if entry.service == id && entry.line.seq > last_seen => {
            Some(Ok(log_event(&entry.line)))
        }
        _ => None,
    });
    Ok(Sse::new(replay.chain(live)).keep_alive(KeepAlive::default()))
}
