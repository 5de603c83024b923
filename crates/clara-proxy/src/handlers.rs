//! Request handlers for the proxy surface.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures_util::{StreamExt, stream};
use reqwest::Client;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};

use clara_core::{Config, ProxyError};
use clara_runtime::{AdmissionMode, Manager};

use crate::body::peek_model;
use crate::forward::{attach_guard, forward_request};
use crate::models::{ErrorResponse, ModelsResponse};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub client: Client,
    /// Config file re-read by `POST /api/server/restart`.
    pub config_path: PathBuf,
}

/// Liveness of the proxy itself (not of any subprocess).
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok"
    }))
}

/// `GET /v1/models` — listed models with current state.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let statuses = state.manager.list_models().await;
    Json(ModelsResponse::from_statuses(statuses))
}

/// Inference passthrough: sniff `model`, admit, forward, stream back.
///
/// Serves every OpenAI-compatible endpoint plus the bare llama-server
/// ones (`/infill`, `/completion`); the path is forwarded verbatim.
pub async fn passthrough(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let peeked = match peek_model(body).await {
        Ok(peeked) => peeked,
        Err(e) => {
            // Client went away mid-upload; nothing sensible to answer.
            info!(error = %e, "request body read failed");
            return error_response(&ProxyError::Cancelled);
        }
    };
    let Some(model) = peeked.model.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(
                "request body has no model field",
                "invalid_request",
            )),
        )
            .into_response();
    };

    info!(
        model = %model,
        path = %parts.uri.path(),
        streaming = peeked.stream,
        "routing request"
    );

    let ticket = match state.manager.acquire(&model, AdmissionMode::Queue).await {
        Ok(ticket) => ticket,
        Err(e) => return error_response(&e),
    };

    let (upstream, guard) = ticket.into_parts();
    let response = forward_request(&state.client, &upstream, parts, peeked).await;
    // The slot stays held until the streamed body is fully delivered.
    attach_guard(response, guard)
}

/// `POST /api/models/unload` — stop everything, keep it restartable.
pub async fn unload_models(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.unload_all().await;
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /api/server/restart` — re-read the config file, apply it, then
/// unload so the next request starts from the new definitions.
///
/// A config error leaves the previous configuration intact.
pub async fn restart_server(State(state): State<AppState>) -> Response {
    let config = match Config::load(&state.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %state.config_path.display(), "restart aborted, config invalid");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(e.to_string(), "invalid_config")),
            )
                .into_response();
        }
    };
    state.manager.reload(config).await;
    state.manager.unload_all().await;
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Filter by source (a model id, or `proxy`).
    pub source: Option<String>,
    /// Replay starts after this cursor. Defaults to the whole retention.
    #[serde(default)]
    pub cursor: u64,
}

/// `GET /api/logs` — retained log lines.
pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let entries = state
        .manager
        .logs()
        .history(query.source.as_deref(), query.cursor);
    Json(entries)
}

/// `GET /api/logs/stream` — SSE live tail, resumable by cursor.
pub async fn stream_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let (history, rx) = state.manager.logs().subscribe_from(query.cursor);
    let replayed_to = history.last().map_or(query.cursor, |e| e.cursor);
    let source = query.source;

    let replay = stream::iter(history);
    let live = BroadcastStream::new(rx)
        // Lagged subscribers skip ahead; entries already replayed are
        // deduplicated by cursor.
        .filter_map(|item| std::future::ready(item.ok()))
        .filter(move |entry| std::future::ready(entry.cursor > replayed_to));

    let events = replay
        .chain(live)
        .filter(move |entry| {
            std::future::ready(
                source
                    .as_deref()
                    .is_none_or(|s| entry.source == s),
            )
        })
        .map(|entry| Event::default().json_data(&entry));

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Map a runtime error onto the wire.
fn error_response(err: &ProxyError) -> Response {
    let status = StatusCode::from_u16(err.suggested_status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(ErrorResponse::from(err))).into_response();

    if status == StatusCode::SERVICE_UNAVAILABLE
        && let Ok(value) = "5".parse()
    {
        response.headers_mut().insert("retry-after", value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn unavailable_carries_retry_after() {
        let response = error_response(&ProxyError::Unavailable {
            model: "m".into(),
            reason: "timeout".into(),
        });
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
    }

    #[test]
    fn not_found_has_no_retry_after() {
        let response = error_response(&ProxyError::NotFound("m".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("retry-after").is_none());
    }
}
