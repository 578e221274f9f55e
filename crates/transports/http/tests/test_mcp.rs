//! MCP adapter integration tests
//!
//! Exercises the Streamable HTTP transport and the unified tool endpoint
//! against the scripted engine backend.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use statabridge_core::worker::scripted::ScriptedFactory;
use statabridge_core::{ServerConfig, SessionManager};
use statabridge_http::HttpServer;
use std::sync::Arc;
use tower::ServiceExt;

fn bridge() -> (Router, Arc<SessionManager>) {
    let config = ServerConfig {
        state_dir: std::env::temp_dir().join(format!(
            "statabridge-mcp-test-{}-{:?}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
        )),
        multi_session: true,
        default_run_timeout: 5,
        ..ServerConfig::default()
    };
    let manager = SessionManager::new(config, Arc::new(ScriptedFactory::default()));
    let router = HttpServer::new(manager.clone()).build_router();
    (router, manager)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn rpc(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp-streamable")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

#[tokio::test]
async fn test_initialize_handshake() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": { "name": "test", "version": "0" }
            }
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("mcp-session-id"));

    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(body["result"]["serverInfo"]["name"], "statabridge");
}

#[tokio::test]
async fn test_initialized_notification_is_accepted() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_tools_list() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/list"
        })))
        .await
        .expect("response");
    let body = body_json(response).await;
    let tools = body["result"]["tools"].as_array().expect("tools");
    let names: Vec<&str> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap_or_default())
        .collect();
    assert!(names.contains(&"stata_run_selection"));
    assert!(names.contains(&"stata_sessions_create"));
    assert!(!names.iter().any(|n| n.contains("stream")));
}

#[tokio::test]
async fn test_tools_call_run_selection() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {
                "name": "stata_run_selection",
                "arguments": { "code": "display 42" }
            }
        })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["id"], 3);
    assert_eq!(body["result"]["isError"], false);
    let text = body["result"]["content"][0]["text"]
        .as_str()
        .expect("content text");
    assert!(text.contains("42"));
    assert!(text.contains("success"));
}

#[tokio::test]
async fn test_tools_call_streams_when_accepted() {
    let (router, _manager) = bridge();
    let request = Request::builder()
        .method("POST")
        .uri("/mcp-streamable")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": {
                    "name": "stata_run_selection",
                    "arguments": { "code": "sleep 200" },
                    "_meta": { "progressToken": "tok-1" }
                }
            })
            .to_string(),
        ))
        .expect("request");

    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // The stream ends with the JSON-RPC response frame.
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("\"id\":4"));
    assert!(text.contains("isError"));
}

#[tokio::test]
async fn test_unknown_method_and_parse_errors() {
    let (router, _manager) = bridge();
    let response = router
        .clone()
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "resources/list"
        })))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32601);

    let request = Request::builder()
        .method("POST")
        .uri("/mcp-streamable")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("this is not json"))
        .expect("request");
    let response = router.oneshot(request).await.expect("response");
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
}

#[tokio::test]
async fn test_unknown_tool_is_invalid_params() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 6,
            "method": "tools/call",
            "params": { "name": "stata_delete_everything", "arguments": {} }
        })))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn test_unified_tool_endpoint() {
    let (router, manager) = bridge();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tools")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "tool": "stata_sessions_create", "parameters": {} }).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let id = body["session_id"].as_str().expect("session id");
    assert!(manager.get(id).await.is_ok());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/tools")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "tool": "no_such_tool", "parameters": {} }).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_legacy_sse_transport_surface() {
    let (router, _manager) = bridge();

    // The stream opens as SSE; it stays alive, so only headers are checked.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/mcp")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));
    drop(response);

    // Posting to a connection that is not open is a 404.
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp/messages?session_id=nope")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_streamable_get_is_method_not_allowed() {
    let (router, _manager) = bridge();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/mcp-streamable")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_sessions_tools_round_trip() {
    let (router, _manager) = bridge();

    let response = router
        .clone()
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "tools/call",
            "params": { "name": "stata_sessions_create", "arguments": {} }
        })))
        .await
        .expect("response");
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().expect("text");
    let created: Value = serde_json::from_str(text).expect("created json");
    let id = created["session_id"].as_str().expect("id").to_string();

    let response = router
        .oneshot(rpc(json!({
            "jsonrpc": "2.0",
            "id": 8,
            "method": "tools/call",
            "params": {
                "name": "stata_sessions_delete",
                "arguments": { "session_id": id }
            }
        })))
        .await
        .expect("response");
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().expect("text");
    assert!(text.contains("deleted"));
}
