use std::net::SocketAddr;

use tracing::{error, info};

mod api;
mod app_state;
mod apply;
mod bootstrap;
mod catalog;
mod installer;
mod logs;
mod openapi;
mod process_adapter;
mod responses;
mod restart;
mod router;
mod security;
mod supervisor;
mod tasks;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    match bootstrap::ensure_openapi_export() {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(err) => {
            eprintln!("error: failed to write OPENAPI_OUT: {err}");
            std::process::exit(2);
        }
    }

    hearth_otel::init();
    let settings = match hearth_core::Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let addr = settings.bind;
    let bootstrap::BootstrapOutput {
        router,
        state,
        background_tasks,
    } = match bootstrap::build(settings).await {
        Ok(out) => out,
        Err(err) => {
            error!(target: "hearth::bootstrap", "startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(target: "hearth::bootstrap", %addr, "bind failed: {err}");
            std::process::exit(1);
        }
    };
    info!(target: "hearth::bootstrap", %addr, "hearth listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("stopping supervised services");
    if let Err(err) = state.supervisor().stop_all().await {
        error!(target: "hearth::supervisor", "stop_all failed: {err}");
    }
    state.supervisor().shutdown().await;
    background_tasks
        .shutdown_with_grace(app_state::TASK_SHUTDOWN_GRACE)
        .await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
