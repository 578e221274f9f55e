//! MCP adapter
//!
//! One tool surface shared by two transports: the legacy SSE transport at
//! `/mcp` and Streamable HTTP at `/mcp-streamable`. The unified
//! `POST /v1/tools` endpoint invokes the same tools outside JSON-RPC.
//! Streaming run endpoints are HTTP-only and deliberately not exposed as
//! tools.

pub mod sse;
pub mod streamable;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use statabridge_core::Error;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ApiResult;
use crate::state::AppState;
use crate::stream::LogTailer;

/// Protocol revision implemented by the Streamable HTTP transport.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Notification cadence during long tool calls, keeps assistant HTTP
/// connections alive past their default timeouts.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Log lines quoted in each progress notification.
const PROGRESS_TAIL_LINES: usize = 5;

/// Wire descriptions of every exposed tool
pub fn tool_catalog() -> Vec<Value> {
    vec![
        json!({
            "name": "stata_run_selection",
            "description": "Run a fragment of Stata code and return its output",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Stata code to execute" },
                    "session_id": { "type": "string", "description": "Target session (optional)" },
                    "timeout": { "type": "integer", "description": "Wall-clock limit in seconds" }
                },
                "required": ["code"]
            }
        }),
        json!({
            "name": "stata_run_file",
            "description": "Run a do-file and return its output",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "file_path": { "type": "string", "description": "Absolute path of the do-file" },
                    "session_id": { "type": "string", "description": "Target session (optional)" },
                    "timeout": { "type": "integer", "description": "Wall-clock limit in seconds" }
                },
                "required": ["file_path"]
            }
        }),
        json!({
            "name": "stata_view_data",
            "description": "Column-major snapshot of the dataset in memory",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string", "description": "Target session (optional)" },
                    "if_condition": { "type": "string", "description": "Stata if-expression filter" },
                    "max_rows": { "type": "integer", "description": "Row ceiling for the snapshot" }
                }
            }
        }),
        json!({
            "name": "stata_sessions_list",
            "description": "List execution sessions",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "stata_sessions_create",
            "description": "Create a new isolated execution session",
            "inputSchema": { "type": "object", "properties": {} }
        }),
        json!({
            "name": "stata_sessions_delete",
            "description": "Destroy an execution session",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string", "description": "Session to destroy" }
                },
                "required": ["session_id"]
            }
        }),
        json!({
            "name": "stata_sessions_restart",
            "description": "Restart a session's engine, wiping interpreter state",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "session_id": { "type": "string", "description": "Target session (optional)" }
                }
            }
        }),
    ]
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Invoke one tool against the session manager.
pub async fn call_tool(state: &AppState, name: &str, args: &Value) -> Result<Value, Error> {
    let manager = &state.manager;
    match name {
        "stata_run_selection" => {
            let code = arg_str(args, "code")
                .ok_or_else(|| Error::BadRequest("code is required".to_string()))?;
            let session_id = manager.resolve(arg_str(args, "session_id").as_deref()).await?;
            let timeout = args.get("timeout").and_then(Value::as_u64);
            let result = manager
                .run_selection(&session_id, &code, None, timeout, false)
                .await?;
            let mut body = serde_json::to_value(result)?;
            body["session_id"] = json!(session_id);
            Ok(body)
        }
        "stata_run_file" => {
            let path = arg_str(args, "file_path")
                .ok_or_else(|| Error::BadRequest("file_path is required".to_string()))?;
            let session_id = manager.resolve(arg_str(args, "session_id").as_deref()).await?;
            let timeout = args.get("timeout").and_then(Value::as_u64);
            let result = manager
                .run_file(&session_id, path.into(), None, timeout)
                .await?;
            let mut body = serde_json::to_value(result)?;
            body["session_id"] = json!(session_id);
            Ok(body)
        }
        "stata_view_data" => {
            let session_id = manager.resolve(arg_str(args, "session_id").as_deref()).await?;
            let max_rows = args.get("max_rows").and_then(Value::as_u64).map(|n| n as usize);
            let view = manager
                .view_data(&session_id, arg_str(args, "if_condition"), max_rows)
                .await?;
            let mut body = serde_json::to_value(view)?;
            body["session_id"] = json!(session_id);
            Ok(body)
        }
        "stata_sessions_list" => {
            let sessions = manager.list().await;
            Ok(json!({ "sessions": sessions }))
        }
        "stata_sessions_create" => {
            let summary = manager.create_session().await?;
            Ok(serde_json::to_value(summary)?)
        }
        "stata_sessions_delete" => {
            let session_id = arg_str(args, "session_id")
                .ok_or_else(|| Error::BadRequest("session_id is required".to_string()))?;
            manager.destroy(&session_id).await?;
            Ok(json!({ "session_id": session_id, "deleted": true }))
        }
        "stata_sessions_restart" => {
            let session_id = manager.resolve(arg_str(args, "session_id").as_deref()).await?;
            manager.restart(&session_id).await?;
            Ok(json!({ "session_id": session_id, "restarted": true }))
        }
        other => Err(Error::BadRequest(format!("unknown tool: {other}"))),
    }
}

/// Body of `POST /v1/tools`
#[derive(Debug, Deserialize)]
pub struct ToolInvocation {
    /// Tool name from the catalog
    pub tool: String,
    /// Tool arguments
    #[serde(default)]
    pub parameters: Value,
}

/// POST /v1/tools - unified tool invocation outside JSON-RPC
pub async fn invoke_tool(
    State(state): State<AppState>,
    Json(invocation): Json<ToolInvocation>,
) -> ApiResult<Json<Value>> {
    let result = call_tool(&state, &invocation.tool, &invocation.parameters).await?;
    Ok(Json(result))
}

// JSON-RPC plumbing shared by both MCP transports.

pub(crate) fn rpc_response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub(crate) fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Wrap a tool outcome as a `tools/call` result.
fn tool_call_result(outcome: Result<Value, Error>) -> Result<Value, Value> {
    match outcome {
        Ok(value) => {
            let text =
                serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
            Ok(json!({
                "content": [{ "type": "text", "text": text }],
                "isError": false
            }))
        }
        Err(err) if err.code() == "bad_request" => Err(json!({
            "code": -32602,
            "message": err.to_string()
        })),
        Err(err) => Ok(json!({
            "content": [{ "type": "text", "text": err.to_string() }],
            "isError": true
        })),
    }
}

/// Run `tools/call`, pushing progress notifications while it executes.
///
/// Every frame sent on `frames` is a complete JSON-RPC object; the
/// response (the only frame with an `id`) is always last.
pub(crate) async fn run_tool_call(
    state: AppState,
    request_id: Value,
    name: String,
    args: Value,
    progress_token: Option<Value>,
    frames: mpsc::Sender<Value>,
) {
    let long_running = matches!(name.as_str(), "stata_run_selection" | "stata_run_file");
    if !long_running {
        let outcome = call_tool(&state, &name, &args).await;
        let frame = match tool_call_result(outcome) {
            Ok(result) => rpc_response(&request_id, result),
            Err(error) => json!({ "jsonrpc": "2.0", "id": request_id, "error": error }),
        };
        let _ = frames.send(frame).await;
        return;
    }

    // Long run: watch the session log while the tool executes.
    let tail = match state
        .manager
        .resolve(arg_str(&args, "session_id").as_deref())
        .await
    {
        Ok(session_id) => state
            .manager
            .get(&session_id)
            .await
            .ok()
            .map(|summary| {
                LogTailer::new(
                    summary.log_path.clone(),
                    LogTailer::current_len(&summary.log_path),
                )
            }),
        Err(_) => None,
    };

    let call = call_tool(&state, &name, &args);
    tokio::pin!(call);

    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await; // swallow the immediate first tick
    let mut tail = tail;

    let outcome = loop {
        tokio::select! {
            outcome = &mut call => break outcome,
            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs();
                let recent: Vec<String> = tail
                    .as_mut()
                    .map(|t| t.read_new())
                    .unwrap_or_default()
                    .into_iter()
                    .rev()
                    .take(PROGRESS_TAIL_LINES)
                    .rev()
                    .collect();
                let message = json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/message",
                    "params": {
                        "level": "info",
                        "logger": "statabridge",
                        "data": {
                            "elapsed_seconds": elapsed,
                            "recent_output": recent,
                        }
                    }
                });
                // A dropped receiver is fine; the run still completes.
                let _ = frames.send(message).await;
                if let Some(token) = &progress_token {
                    let progress = json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/progress",
                        "params": {
                            "progressToken": token,
                            "progress": elapsed,
                        }
                    });
                    let _ = frames.send(progress).await;
                }
            }
        }
    };

    let frame = match tool_call_result(outcome) {
        Ok(result) => rpc_response(&request_id, result),
        Err(error) => json!({ "jsonrpc": "2.0", "id": request_id, "error": error }),
    };
    let _ = frames.send(frame).await;
}
