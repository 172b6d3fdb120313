use axum::Json;
use utoipa::OpenApi;

use crate::api::health::Healthz;
use crate::apply::{ApplyResult, OperationOutcome};
use crate::logs::{LogLine, LogStream, LogTail};
use crate::restart::{RestartChoice, RestartJob, RestartPhase};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::api::health::healthz,
        crate::api::queue::queue_get,
        crate::api::queue::queue_put,
        crate::api::queue::queue_delete,
        crate::api::queue::queue_apply,
        crate::api::queue::queue_remove_operation,
        crate::api::config::config_get,
        crate::api::config::extensions_installed,
        crate::api::config::ports_list,
        crate::api::config::extension_patch,
        crate::api::config::extension_remove,
        crate::api::config::tool_patch,
        crate::api::config::tool_remove,
        crate::api::config::core_update,
        crate::api::services::services_list,
        crate::api::services::service_get,
        crate::api::services::service_start,
        crate::api::services::service_stop,
        crate::api::services::service_restart,
        crate::api::services::service_reset,
        crate::api::services::service_logs,
        crate::api::services::service_logs_stream,
        crate::api::system::restart_begin,
        crate::api::system::restart_status,
        crate::api::system::restart_keep_waiting,
        crate::api::system::restart_force_reload,
        crate::api::events::events_sse,
    ),
    components(
        schemas(
            Healthz,
            ApplyResult,
            OperationOutcome,
            LogLine,
            LogStream,
            LogTail,
            RestartJob,
            RestartPhase,
            RestartChoice
        )
    ),
    tags(
        (name = "Health", description = "Liveness and aggregate service health"),
        (name = "Queue", description = "Pending change set and apply"),
        (name = "Config", description = "Desired-state edits"),
        (name = "Services", description = "Supervised service lifecycle and logs"),
        (name = "System", description = "Full-system restart job"),
        (name = "Events", description = "Server-Sent Events stream")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
