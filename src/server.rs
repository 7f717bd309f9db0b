//! Process supervisor: serving, signal handling, and graceful teardown.
//!
//! The shutdown token in [`AppState`] is the single source of truth for
//! "we are going down": `POST /close`, SIGINT, and SIGTERM all cancel it.
//! Once the HTTP server has drained, every live session is closed under a
//! bounded deadline so child shells do not outlive the runtime.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, RouterConfig};

/// Overall budget for closing all sessions at shutdown.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Serve the API until the shutdown token fires, then drain sessions.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    config: RouterConfig,
) -> std::io::Result<()> {
    let app = api::router(state.clone(), config);
    let shutdown = state.shutdown.clone();

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    state.sessions.close_all(SHUTDOWN_DEADLINE).await;
    tracing::info!("runtime stopped");
    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM.
pub fn watch_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(?e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("received interrupt"),
                _ = terminate.recv() => tracing::info!("received terminate"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("received interrupt");
        }
        shutdown.cancel();
    });
}
