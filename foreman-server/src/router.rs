use foreman_core::ipc::{ForemanRequest, ForemanResponse};
use foreman_core::models::stream_key;
use foreman_core::{AppendLog, CheckpointStore};

use crate::app::AppState;

pub async fn handle_request(request: ForemanRequest, state: &AppState) -> ForemanResponse {
    match request {
        ForemanRequest::Ping => ForemanResponse::pong(),
        ForemanRequest::Health => ForemanResponse::ok(state.health()),
        ForemanRequest::Append {
            user_id,
            thread_id,
            values,
        } => {
            if user_id.trim().is_empty() {
                return ForemanResponse::err("user_id is required");
            }
            if values.is_empty() {
                return ForemanResponse::err("values must not be empty");
            }
            match state
                .log
                .append(user_id.trim(), thread_id.as_deref(), values)
                .await
            {
                Ok(id) => ForemanResponse::ok(serde_json::json!({
                    "id": id,
                    "stream": stream_key(&user_id),
                })),
                Err(e) => ForemanResponse::err(e.to_string()),
            }
        }
        ForemanRequest::Checkpoint { user_id, thread_id } => {
            match state.checkpoints.get(&user_id, &thread_id).await {
                Ok(checkpoint) => match serde_json::to_value(&checkpoint) {
                    Ok(data) => ForemanResponse::ok(data),
                    Err(e) => ForemanResponse::err(e.to_string()),
                },
                Err(e) => ForemanResponse::err(format!("Checkpoint read failed: {}", e)),
            }
        }
        ForemanRequest::Trim { user_id, max_len } => {
            let stream = stream_key(&user_id);
            let max_len = max_len.unwrap_or(state.config.streams.max_len);
            match state.log.trim(&stream, max_len).await {
                Ok(removed) => ForemanResponse::ok(serde_json::json!({
                    "stream": stream,
                    "max_len": max_len,
                    "removed": removed,
                })),
                Err(e) => ForemanResponse::err(e.to_string()),
            }
        }
    }
}
