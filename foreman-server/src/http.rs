//! Foreman HTTP API
//!
//! Axum server running alongside the Unix socket IPC server on port 8090
//! (configurable). Each JSON endpoint has a thin handler delegating to an
//! inner function that returns `(StatusCode, Value)` and is tested directly.
//!
//! Endpoints:
//! - GET  /health                         : backends + orchestrator counters
//! - GET  /version                        : server version info
//! - POST /wb/append                      : append an entry to a user stream
//! - GET  /wb/stream                      : live tail as Server-Sent Events
//! - GET  /checkpoints/:user_id/:thread_id: checkpoint inspection
//! - POST /admin/wb/trim                  : trim a user stream

use std::convert::Infallible;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use foreman_core::append_log::TailFrom;
use foreman_core::ipc::{ForemanRequest, ForemanResponse};
use foreman_core::models::{stream_key, LogEntry, Values};
use foreman_core::AppendLog;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::subsystems::fanout::SubscribeRequest;

const LAST_EVENT_ID: &str = "last-event-id";

/// Build the Axum router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/wb/append", post(append_handler))
        .route("/wb/stream", get(stream_handler))
        .route("/checkpoints/:user_id/:thread_id", get(checkpoint_handler))
        .route("/admin/wb/trim", post(trim_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when `cancel` fires.
pub async fn start_http_server(state: AppState, cancel: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);
    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Foreman HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct AppendRequest {
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
    #[serde(default)]
    pub values: Values,
}

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    pub user_id: Option<String>,
    pub thread_id: Option<String>,
    /// Resume cursor; `$` or absent means only new entries.
    pub after: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TrimRequest {
    pub user_id: Option<String>,
    pub max_len: Option<usize>,
}

fn bad_request(msg: &str) -> (StatusCode, serde_json::Value) {
    (
        StatusCode::BAD_REQUEST,
        json!({
            "error": msg,
            "status": "error",
        }),
    )
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

pub fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    let mut body = state.health();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
        obj.insert("socket".to_string(), json!(state.config.service.socket_path));
    }
    (StatusCode::OK, body)
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "foreman/1",
    })
}

pub async fn append_inner(state: &AppState, req: AppendRequest) -> (StatusCode, serde_json::Value) {
    let Some(user_id) = non_blank(req.user_id) else {
        return bad_request("user_id is required");
    };
    let Some(thread_id) = non_blank(req.thread_id) else {
        return bad_request("thread_id is required");
    };
    if req.values.is_empty() {
        return bad_request("values must not be empty");
    }

    match state.log.append(&user_id, Some(&thread_id), req.values).await {
        Ok(id) => (
            StatusCode::OK,
            json!({
                "ok": true,
                "id": id,
                "stream": stream_key(&user_id),
                "user_id": user_id,
                "thread_id": thread_id,
                "appended_at": id.timestamp().to_rfc3339(),
            }),
        ),
        Err(e) => {
            tracing::warn!(user = %user_id, error = %e, "Append failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "error": e.to_string(),
                    "status": "error",
                }),
            )
        }
    }
}

pub async fn checkpoint_inner(
    state: &AppState,
    user_id: String,
    thread_id: String,
) -> (StatusCode, serde_json::Value) {
    let response =
        crate::router::handle_request(ForemanRequest::Checkpoint { user_id, thread_id }, state)
            .await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::OK, data),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": e,
                "status": "error",
            }),
        ),
    }
}

pub async fn trim_inner(state: &AppState, req: TrimRequest) -> (StatusCode, serde_json::Value) {
    let Some(user_id) = non_blank(req.user_id) else {
        return bad_request("user_id is required");
    };
    let response = crate::router::handle_request(
        ForemanRequest::Trim {
            user_id,
            max_len: req.max_len,
        },
        state,
    )
    .await;
    match response_to_http(response) {
        Ok(data) => (StatusCode::OK, data),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": e,
                "status": "error",
            }),
        ),
    }
}

/// JSON body of one pushed entry.
pub fn entry_frame(entry: &LogEntry) -> serde_json::Value {
    json!({
        "entry_id": entry.id,
        "stream": entry.stream,
        "user_id": entry.user_id,
        "thread_id": entry.thread_id,
        "values": entry.values,
        "timestamp": entry.created_at.to_rfc3339(),
    })
}

// ============================================================================
// Axum handler wrappers (thin: delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, body) = health_inner(&state);
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn append_handler(
    State(state): State<AppState>,
    Json(req): Json<AppendRequest>,
) -> impl IntoResponse {
    let (status, body) = append_inner(&state, req).await;
    (status, Json(body))
}

pub async fn checkpoint_handler(
    State(state): State<AppState>,
    Path((user_id, thread_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let (status, body) = checkpoint_inner(&state, user_id, thread_id).await;
    (status, Json(body))
}

pub async fn trim_handler(
    State(state): State<AppState>,
    Json(req): Json<TrimRequest>,
) -> impl IntoResponse {
    let (status, body) = trim_inner(&state, req).await;
    (status, Json(body))
}

/// Live tail as SSE. The cursor comes from `after`, falling back to the
/// `Last-Event-ID` header a reconnecting browser sends.
pub async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Response {
    let Some(user_id) = non_blank(query.user_id) else {
        let (status, body) = bad_request("user_id is required");
        return (status, Json(body)).into_response();
    };
    let after = query.after.or_else(|| {
        headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let from = match TailFrom::parse(after.as_deref()) {
        Ok(from) => from,
        Err(e) => {
            let (status, body) = bad_request(&e.to_string());
            return (status, Json(body)).into_response();
        }
    };

    let subscription = match state
        .fanout
        .subscribe(SubscribeRequest {
            user_id,
            thread_id: query.thread_id,
            from,
        })
        .await
    {
        Ok(sub) => sub,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": e.to_string(),
                    "status": "error",
                })),
            )
                .into_response();
        }
    };

    let events = subscription.into_stream().map(|entry| {
        Ok::<_, Infallible>(
            Event::default()
                .id(entry.id.to_string())
                .data(entry_frame(&entry).to_string()),
        )
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.fanout.keepalive()))
        .into_response()
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert an IPC `ForemanResponse` into an HTTP body value, or an error string.
pub fn response_to_http(response: ForemanResponse) -> std::result::Result<serde_json::Value, String> {
    if response.is_ok() {
        Ok(response.data.unwrap_or(json!({})))
    } else {
        Err(response.error.unwrap_or_else(|| "unknown error".to_string()))
    }
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================
