//! Axum HTTP server for the OpenAI-compatible proxy surface.
//!
//! Inference endpoints share one passthrough handler; the path reaching
//! the multiplexer is the path the subprocess sees.

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::handlers::{self, AppState};

/// Build the full route table over shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/chat/completions", post(handlers::passthrough))
        .route("/v1/completions", post(handlers::passthrough))
        .route("/v1/embeddings", post(handlers::passthrough))
        .route("/v1/rerank", post(handlers::passthrough))
        .route("/v1/audio/*rest", post(handlers::passthrough))
        .route("/infill", post(handlers::passthrough))
        .route("/completion", post(handlers::passthrough))
        .route("/api/models/unload", post(handlers::unload_models))
        .route("/api/server/restart", post(handlers::restart_server))
        .route("/api/logs", get(handlers::get_logs))
        .route("/api/logs/stream", get(handlers::stream_logs))
        .with_state(state)
}

/// Serve the proxy on a pre-bound listener until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let app = router(state);

    info!("proxy listening on {addr}");
    info!("OpenAI-compatible endpoints under http://{addr}/v1");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("proxy server shut down");
    Ok(())
}
