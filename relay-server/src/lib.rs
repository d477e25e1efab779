//! # Relay Server
//!
//! HTTP front end for [`relay_core`]: accepts a prompt, runs a background
//! task for it and streams the process log back as server-sent events.

pub mod routes;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

pub use routes::{router, AppState, PromptRequest};

/// Serve `state` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);
    info!("  POST /process/ - Stream a background task's progress");
    info!("  GET  /health   - Health check");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server stopped");
    Ok(())
}
