use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::apply::ApplyError;
use crate::catalog::CatalogError;
use crate::restart::RestartError;
use crate::supervisor::SupervisorError;

pub fn problem_response(status: StatusCode, title: &str, detail: Option<&str>) -> Response {
    let mut body = json!({
        "type": "about:blank",
        "title": title,
        "status": status.as_u16(),
    });
    if let Some(detail) = detail {
        body["detail"] = json!(detail);
    }
    (status, Json(body)).into_response()
}

pub fn unauthorized() -> Response {
    problem_response(StatusCode::UNAUTHORIZED, "Unauthorized", None)
}

/// Every handler failure funnels through here so clients always see
/// problem-details JSON.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] hearth_core::Error),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Restart(#[from] RestartError),
    #[error("{0}")]
    BadRequest(String),
    #[error("admin token required")]
    Unauthorized,
}

fn core_status(err: &hearth_core::Error) -> (StatusCode, &'static str) {
    use hearth_core::Error as Core;
    match err {
        Core::Validation(_) => (StatusCode::BAD_REQUEST, "Validation Failed"),
        Core::UnknownOperation(_) | Core::NoQueue => (StatusCode::NOT_FOUND, "Not Found"),
        Core::PortsExhausted { .. } => (StatusCode::SERVICE_UNAVAILABLE, "Ports Exhausted"),
        Core::Malformed { .. } | Core::Io { .. } | Core::Settings(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error")
        }
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Core(err)
            | ApiError::Apply(ApplyError::Core(err))
            | ApiError::Catalog(CatalogError::Core(err)) => core_status(err),
            ApiError::Apply(ApplyError::Busy) => (StatusCode::CONFLICT, "Apply In Progress"),
            ApiError::Apply(ApplyError::NothingQueued) => (StatusCode::NOT_FOUND, "Not Found"),
            ApiError::Supervisor(SupervisorError::UnknownService(_))
            | ApiError::Catalog(CatalogError::Supervisor(SupervisorError::UnknownService(_))) => {
                (StatusCode::NOT_FOUND, "Unknown Service")
            }
            ApiError::Supervisor(_) | ApiError::Catalog(CatalogError::Supervisor(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Supervisor Error")
            }
            ApiError::Restart(RestartError::InProgress) => {
                (StatusCode::CONFLICT, "Restart In Progress")
            }
            ApiError::Restart(RestartError::NotWaiting) => {
                (StatusCode::CONFLICT, "Restart Not Waiting")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, ApiError::Unauthorized) {
            return unauthorized();
        }
        let (status, title) = self.status();
        let detail = self.to_string();
        if status.is_server_error() {
            error!(target: "hearth::api", %status, error = %detail, "request failed");
        }
        problem_response(status, title, Some(&detail))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Mutating handlers call this first.
pub(crate) fn require_admin(headers: &axum::http::HeaderMap) -> ApiResult<()> {
    if crate::security::admin_ok(headers) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_statuses() {
        let cases: Vec<(ApiError, StatusCode)> = vec![
            (
                hearth_core::Error::Validation("bad".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (hearth_core::Error::NoQueue.into(), StatusCode::NOT_FOUND),
            (ApplyError::Busy.into(), StatusCode::CONFLICT),
            (
                SupervisorError::UnknownService("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (RestartError::InProgress.into(), StatusCode::CONFLICT),
            (
                hearth_core::Error::PortsExhausted {
                    scope: hearth_core::PortScope::ExtensionService,
                    start: 5300,
                    end: 5399,
                }
                .into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                CatalogError::Core(hearth_core::Error::Validation("x".into())).into(),
                StatusCode::BAD_REQUEST,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.into_response().status(), want);
        }
    }
}
