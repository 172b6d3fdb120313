use std::mem;
use std::sync::Arc;

use axum::{
    handler::Handler,
    routing::{delete, get, patch, post, put, MethodRouter},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{api, openapi, AppState};

pub(crate) mod paths {
    pub const HEALTHZ: &str = "/healthz";
    pub const ABOUT: &str = "/about";
    pub const OPENAPI: &str = "/openapi.json";
    pub const EVENTS: &str = "/events";
    pub const QUEUE: &str = "/queue";
    pub const QUEUE_APPLY: &str = "/queue/apply";
    pub const QUEUE_REMOVE: &str = "/queue/remove";
    pub const CONFIG: &str = "/config";
    pub const EXTENSIONS: &str = "/extensions";
    pub const PORTS: &str = "/ports";
    pub const CONFIG_EXTENSION: &str = "/config/extensions/{name}";
    pub const CONFIG_TOOL: &str = "/config/tools/{name}";
    pub const CONFIG_CORE_UPDATE: &str = "/config/core/update";
    pub const SERVICES: &str = "/services";
    pub const SERVICE: &str = "/services/{id}";
    pub const SERVICE_START: &str = "/services/{id}/start";
    pub const SERVICE_STOP: &str = "/services/{id}/stop";
    pub const SERVICE_RESTART: &str = "/services/{id}/restart";
    pub const SERVICE_RESET: &str = "/services/{id}/reset";
    pub const SERVICE_LOGS: &str = "/services/{id}/logs";
    pub const SERVICE_LOGS_STREAM: &str = "/services/{id}/logs/stream";
    pub const SYSTEM_RESTART: &str = "/system/restart";
    pub const SYSTEM_RESTART_KEEP_WAITING: &str = "/system/restart/keep-waiting";
    pub const SYSTEM_RESTART_FORCE_RELOAD: &str = "/system/restart/force-reload";
}

/// Records "METHOD /path" for every route so `/about` can list them.
pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    fn add(&mut self, method: &str, path: &'static str, route: MethodRouter<AppState>) -> &mut Self {
        self.endpoints.push(format!("{method} {path}"));
        let router = mem::take(&mut self.router);
        self.router = router.route(path, route);
        self
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.add("GET", path, get(handler))
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.add("POST", path, post(handler))
    }

    pub fn route_put<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.add("PUT", path, put(handler))
    }

    pub fn route_patch<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.add("PATCH", path, patch(handler))
    }

    pub fn route_delete<H, T>(&mut self, path: &'static str, handler: H) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.add("DELETE", path, delete(handler))
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    use paths::*;

    let mut builder = RouterBuilder::new();
    builder
        .route_get(HEALTHZ, api::health::healthz)
        .route_get(OPENAPI, openapi::openapi_json)
        .route_get(EVENTS, api::events::events_sse)
        .route_get(QUEUE, api::queue::queue_get)
        .route_put(QUEUE, api::queue::queue_put)
        .route_delete(QUEUE, api::queue::queue_delete)
        .route_post(QUEUE_APPLY, api::queue::queue_apply)
        .route_post(QUEUE_REMOVE, api::queue::queue_remove_operation)
        .route_get(CONFIG, api::config::config_get)
        .route_get(EXTENSIONS, api::config::extensions_installed)
        .route_get(PORTS, api::config::ports_list)
        .route_patch(CONFIG_EXTENSION, api::config::extension_patch)
        .route_delete(CONFIG_EXTENSION, api::config::extension_remove)
        .route_patch(CONFIG_TOOL, api::config::tool_patch)
        .route_delete(CONFIG_TOOL, api::config::tool_remove)
        .route_put(CONFIG_CORE_UPDATE, api::config::core_update)
        .route_get(SERVICES, api::services::services_list)
        .route_get(SERVICE, api::services::service_get)
        .route_post(SERVICE_START, api::services::service_start)
        .route_post(SERVICE_STOP, api::services::service_stop)
        .route_post(SERVICE_RESTART, api::services::service_restart)
        .route_post(SERVICE_RESET, api::services::service_reset)
        .route_get(SERVICE_LOGS, api::services::service_logs)
        .route_get(SERVICE_LOGS_STREAM, api::services::service_logs_stream)
        .route_post(SYSTEM_RESTART, api::system::restart_begin)
        .route_get(SYSTEM_RESTART, api::system::restart_status)
        .route_post(SYSTEM_RESTART_KEEP_WAITING, api::system::restart_keep_waiting)
        .route_post(SYSTEM_RESTART_FORCE_RELOAD, api::system::restart_force_reload);
    let (router, mut endpoints) = builder.build();

    endpoints.push(format!("GET {ABOUT}"));
    let endpoints = Arc::new(endpoints);
    let bind = state.settings().bind.to_string();
    let about = get(move || {
        let endpoints = endpoints.clone();
        let bind = bind.clone();
        async move {
            Json(json!({
                "service": "hearth-server",
                "version": env!("CARGO_PKG_VERSION"),
                "bind": bind,
                "endpoints": endpoints.as_slice(),
            }))
        }
    });

    router
        .route(ABOUT, about)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
