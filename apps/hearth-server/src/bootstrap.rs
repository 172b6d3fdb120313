use std::net::SocketAddr;

use hearth_core::Settings;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::openapi::ApiDoc;
use crate::tasks::{spawn_supervised, TaskHandle, TaskManager};
use crate::{router, AppState};

pub(crate) struct BootstrapOutput {
    pub router: axum::Router,
    pub state: AppState,
    pub background_tasks: TaskManager,
}

/// Wire the hub, reconcile the registry with the applied config, and start
/// (or adopt) every enabled service.
pub(crate) async fn build(settings: Settings) -> anyhow::Result<BootstrapOutput> {
    warn_if_exposed(settings.bind);
    let (state, tasks) = AppState::builder(settings).build()?;
    let mut background_tasks = TaskManager::from(tasks);
    background_tasks.push(spawn_service_journal(&state));

    let ids = state.catalog().sync_all().await?;
    info!(target: "hearth::bootstrap", services = ids.len(), "service registry synced");
    let started = state.catalog().start_enabled(true).await?;
    info!(target: "hearth::bootstrap", started = started.len(), "enabled services started");

    Ok(BootstrapOutput {
        router: router::build_router(state.clone()),
        state,
        background_tasks,
    })
}

/// Mirror lifecycle events into the hub's own log.
fn spawn_service_journal(state: &AppState) -> TaskHandle {
    let bus = state.bus().clone();
    spawn_supervised("service.journal", move || {
        let mut rx = bus.subscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(env) if env.kind == hearth_topics::TOPIC_SERVICE_STATE_CHANGED => {
                        info!(
                            target: "hearth::supervisor",
                            service = %env.payload["id"].as_str().unwrap_or("?"),
                            state = %env.payload["state"].as_str().unwrap_or("?"),
                            summary = %env.payload["summary"].as_str().unwrap_or(""),
                            "service state changed"
                        );
                    }
                    Ok(env) if env.kind == hearth_topics::TOPIC_SERVICE_RESTART_EXHAUSTED => {
                        warn!(
                            target: "hearth::supervisor",
                            service = %env.payload["id"].as_str().unwrap_or("?"),
                            "restart budget exhausted; service left failed"
                        );
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "hearth::supervisor", skipped, "service journal lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

fn warn_if_exposed(bind: SocketAddr) {
    let token_set = hearth_core::util::env_string("HEARTH_ADMIN_TOKEN").is_some()
        || hearth_core::util::env_string("HEARTH_ADMIN_TOKEN_SHA256").is_some();
    if !bind.ip().is_loopback() && !token_set {
        warn!(
            target: "hearth::bootstrap",
            %bind,
            "listening beyond loopback without HEARTH_ADMIN_TOKEN; mutating endpoints are open"
        );
    }
}

/// `OPENAPI_OUT=<path>` writes the document and exits instead of serving.
pub(crate) fn ensure_openapi_export() -> Result<Option<String>, std::io::Error> {
    if let Ok(path) = std::env::var("OPENAPI_OUT") {
        use utoipa::OpenApi;
        let doc = ApiDoc::openapi()
            .to_pretty_json()
            .map_err(std::io::Error::other)?;
        if let Some(parent) = std::path::Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&path, doc)?;
        return Ok(Some(path));
    }
    Ok(None)
}
