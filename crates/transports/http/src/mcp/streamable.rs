//! Streamable HTTP transport
//!
//! JSON-RPC 2.0 over a single endpoint. Plain requests answer as
//! `application/json`; a `tools/call` for a long run answers as
//! `text/event-stream` when the client accepts it, carrying progress
//! notifications before the final response.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::convert::Infallible;
use tokio::sync::mpsc;

use super::{rpc_error, rpc_response, run_tool_call, tool_catalog, PROTOCOL_VERSION};
use crate::state::AppState;

/// GET /mcp-streamable - no server-initiated stream is offered
pub async fn reject_get() -> StatusCode {
    StatusCode::METHOD_NOT_ALLOWED
}

/// POST /mcp-streamable - one JSON-RPC request per POST
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        return Json(rpc_error(&Value::Null, -32700, "parse error")).into_response();
    };

    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let id = request.get("id").cloned();
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications (initialized, cancelled, ...) are acknowledged
    // without a body.
    let Some(id) = id else {
        return StatusCode::ACCEPTED.into_response();
    };

    match method {
        "initialize" => {
            let session_id = uuid::Uuid::new_v4().simple().to_string();
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": { "listChanged": false },
                    "logging": {}
                },
                "serverInfo": {
                    "name": "statabridge",
                    "version": env!("CARGO_PKG_VERSION")
                }
            });
            (
                [("Mcp-Session-Id", session_id)],
                Json(rpc_response(&id, result)),
            )
                .into_response()
        }
        "ping" => Json(rpc_response(&id, json!({}))).into_response(),
        "tools/list" => {
            Json(rpc_response(&id, json!({ "tools": tool_catalog() }))).into_response()
        }
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                return Json(rpc_error(&id, -32602, "tool name is required")).into_response();
            }
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let progress_token = params
                .get("_meta")
                .and_then(|meta| meta.get("progressToken"))
                .cloned();

            let (frames_tx, frames_rx) = mpsc::channel::<Value>(64);
            tokio::spawn(run_tool_call(
                state,
                id,
                name.clone(),
                args,
                progress_token,
                frames_tx,
            ));

            if accepts_event_stream(&headers) && is_run_tool(&name) {
                sse_frames(frames_rx).into_response()
            } else {
                // Drain to the terminal response frame.
                final_frame(frames_rx).await.into_response()
            }
        }
        other => {
            Json(rpc_error(&id, -32601, &format!("method not found: {other}")))
                .into_response()
        }
    }
}

fn is_run_tool(name: &str) -> bool {
    matches!(name, "stata_run_selection" | "stata_run_file")
}

fn accepts_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|accept| accept.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Serve every frame as an SSE `message` event; close after the response.
fn sse_frames(
    mut frames: mpsc::Receiver<Value>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(frame) = frames.recv().await {
            let terminal = frame.get("id").is_some();
            yield Ok(Event::default().event("message").data(frame.to_string()));
            if terminal {
                break;
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Discard notifications and answer with the terminal response frame.
async fn final_frame(mut frames: mpsc::Receiver<Value>) -> Json<Value> {
    while let Some(frame) = frames.recv().await {
        if frame.get("id").is_some() {
            return Json(frame);
        }
    }
    Json(rpc_error(
        &Value::Null,
        -32603,
        "tool call ended without a response",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_header_detection() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_event_stream(&headers));
        headers.insert(
            header::ACCEPT,
            "application/json, text/event-stream".parse().unwrap(),
        );
        assert!(accepts_event_stream(&headers));
    }

    #[test]
    fn test_run_tools_are_streamable() {
        assert!(is_run_tool("stata_run_file"));
        assert!(is_run_tool("stata_run_selection"));
        assert!(!is_run_tool("stata_view_data"));
    }
}
