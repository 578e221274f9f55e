//! Legacy SSE transport
//!
//! `GET /mcp` opens the event stream and announces a per-connection POST
//! endpoint; clients send JSON-RPC to `POST /mcp/messages` and read every
//! response off the stream. Kept for clients that predate Streamable HTTP.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{rpc_error, rpc_response, run_tool_call, tool_catalog, PROTOCOL_VERSION};
use crate::state::{AppState, McpConnections};

/// Query of `POST /mcp/messages`
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// Connection id announced in the stream's `endpoint` event
    pub session_id: String,
}

/// Removes the connection from the registry when the stream drops.
struct ConnectionGuard {
    connections: Arc<McpConnections>,
    id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let connections = self.connections.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            connections.remove(&id).await;
        });
    }
}

/// GET /mcp - open the legacy SSE stream
pub async fn open_stream(
    State(state): State<AppState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let (connection_id, mut rx) = state.mcp_connections.register().await;
    let connections = state.mcp_connections.clone();

    let stream = async_stream::stream! {
        let _guard = ConnectionGuard {
            connections,
            id: connection_id.clone(),
        };
        // The client posts JSON-RPC to this URL for the stream's lifetime.
        yield Ok(Event::default()
            .event("endpoint")
            .data(format!("/mcp/messages?session_id={connection_id}")));

        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /mcp/messages - JSON-RPC over an open SSE connection
///
/// Returns 202 immediately; the response (and any progress notifications)
/// are pushed on the stream.
pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let Some(sender) = state.mcp_connections.sender(&query.session_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "code": "session_not_found",
                "message": format!("no open mcp stream for {}", query.session_id),
            })),
        )
            .into_response();
    };

    let Ok(request) = serde_json::from_str::<Value>(&body) else {
        let _ = sender
            .send(rpc_error(&Value::Null, -32700, "parse error").to_string())
            .await;
        return StatusCode::ACCEPTED.into_response();
    };

    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let id = request.get("id").cloned();
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    // Notifications need no reply.
    let Some(id) = id else {
        return StatusCode::ACCEPTED.into_response();
    };

    tokio::spawn(async move {
        match method.as_str() {
            "initialize" => {
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
                let _ = sender.send(rpc_response(&id, result).to_string()).await;
            }
            "ping" => {
                let _ = sender.send(rpc_response(&id, json!({})).to_string()).await;
            }
            "tools/list" => {
                let result = json!({ "tools": tool_catalog() });
                let _ = sender.send(rpc_response(&id, result).to_string()).await;
            }
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if name.is_empty() {
                    let _ = sender
                        .send(rpc_error(&id, -32602, "tool name is required").to_string())
                        .await;
                    return;
                }
                let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                let progress_token = params
                    .get("_meta")
                    .and_then(|meta| meta.get("progressToken"))
                    .cloned();

                let (frames_tx, mut frames_rx) = mpsc::channel::<Value>(64);
                tokio::spawn(run_tool_call(
                    state,
                    id,
                    name,
                    args,
                    progress_token,
                    frames_tx,
                ));
                while let Some(frame) = frames_rx.recv().await {
                    let terminal = frame.get("id").is_some();
                    if sender.send(frame.to_string()).await.is_err() {
                        break;
                    }
                    if terminal {
                        break;
                    }
                }
            }
            other => {
                let _ = sender
                    .send(
                        rpc_error(&id, -32601, &format!("method not found: {other}"))
                            .to_string(),
                    )
                    .await;
            }
        }
    });

    StatusCode::ACCEPTED.into_response()
}
