//! Execution API integration tests
//!
//! Drive the full router against the scripted engine backend; no Stata
//! installation is required.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use statabridge_core::worker::scripted::{ScriptedConfig, ScriptedDataset, ScriptedFactory};
use statabridge_core::{ServerConfig, SessionManager};
use statabridge_http::HttpServer;
use std::sync::Arc;
use tower::ServiceExt;

fn test_config() -> ServerConfig {
    ServerConfig {
        state_dir: std::env::temp_dir().join(format!(
            "statabridge-http-test-{}",
            uuid_suffix()
        )),
        multi_session: true,
        max_sessions: 4,
        default_run_timeout: 5,
        ..ServerConfig::default()
    }
}

fn uuid_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!("{}-{nanos}", std::process::id())
}

fn bridge(config: ServerConfig) -> (Router, Arc<SessionManager>) {
    let manager = SessionManager::new(config, Arc::new(ScriptedFactory::default()));
    let router = HttpServer::new(manager.clone()).build_router();
    (router, manager)
}

fn bridge_with_dataset(config: ServerConfig, dataset: ScriptedDataset) -> (Router, Arc<SessionManager>) {
    let factory = ScriptedFactory::new(ScriptedConfig {
        dataset,
        ..ScriptedConfig::default()
    });
    let manager = SessionManager::new(config, Arc::new(factory));
    let router = HttpServer::new(manager.clone()).build_router();
    (router, manager)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

#[tokio::test]
async fn test_health_reports_engine() {
    let (router, _manager) = bridge(test_config());
    let response = router.oneshot(get("/health")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["engine_available"], true);
    assert_eq!(body["version"], "18.5");
    assert_eq!(body["edition"], "mp");
}

#[tokio::test]
async fn test_run_selection_round_trip() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");

    let response = router
        .clone()
        .oneshot(post_json(
            "/run_selection",
            json!({ "code": "display 42", "session_id": session.session_id }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert!(body["output"].as_str().expect("output").contains("42"));
    assert_eq!(body["session_id"], json!(session.session_id));

    // The session shows ready again in the listing.
    let response = router.oneshot(get("/sessions")).await.expect("response");
    let body = body_json(response).await;
    assert_eq!(body["sessions"][0]["state"], "ready");
}

#[tokio::test]
async fn test_run_selection_requires_code() {
    let (router, _manager) = bridge(test_config());
    let response = router
        .oneshot(post_json("/run_selection", json!({ "code": "" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_engine_error_stays_http_200() {
    let (router, _manager) = bridge(test_config());
    let response = router
        .oneshot(post_json("/run_selection", json!({ "code": "frobnicate" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["output"].as_str().expect("output").contains("r(199);"));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let (router, _manager) = bridge(test_config());
    let response = router
        .oneshot(post_json(
            "/run_selection",
            json!({ "code": "display 1", "session_id": "missing" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "session_not_found");
}

#[tokio::test]
async fn test_run_file_requires_existing_file() {
    let (router, _manager) = bridge(test_config());
    let response = router
        .oneshot(get("/run_file?file_path=/definitely/not/here.do"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_run_file_executes_script() {
    let (router, _manager) = bridge(test_config());
    let dir = tempfile::tempdir().expect("tempdir");
    let dofile = dir.path().join("analysis.do");
    std::fs::write(&dofile, "display 9\n").expect("write dofile");

    let uri = format!("/run_file?file_path={}", dofile.display());
    let response = router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert!(body["output"].as_str().expect("output").contains("9"));
}

#[tokio::test]
async fn test_session_crud() {
    let (router, _manager) = bridge(test_config());

    let response = router
        .clone()
        .oneshot(post_json("/sessions", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let id = created["session_id"].as_str().expect("id").to_string();
    assert_eq!(created["state"], "ready");

    let response = router
        .clone()
        .oneshot(get(&format!("/sessions/{id}")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    // Idempotent delete.
    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{id}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_busy_session_conflicts() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");
    let id = session.session_id.clone();

    let runner = {
        let manager = manager.clone();
        let id = id.clone();
        tokio::spawn(async move {
            manager.run_selection(&id, "sleep 600", None, None, false).await
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/run_selection",
            json!({ "code": "display 1", "session_id": id }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["code"], "session_busy");
    assert_eq!(body["session_state"], "busy");

    // Status shows the in-flight request.
    let response = router
        .clone()
        .oneshot(get(&format!("/execution_status?session_id={id}")))
        .await
        .expect("response");
    let body = body_json(response).await;
    assert_eq!(body["state"], "busy");

    // Stop it and let the run wind down.
    let response = router
        .oneshot(post_json("/stop_execution", json!({ "session_id": id })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_ne!(body["result"], "no_execution");

    let result = runner.await.expect("join").expect("run");
    assert_eq!(result.status, statabridge_core::RunStatus::Cancelled);
}

#[tokio::test]
async fn test_stop_with_nothing_running() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");
    let response = router
        .oneshot(post_json(
            "/stop_execution",
            json!({ "session_id": session.session_id }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["result"], "no_execution");
}

#[tokio::test]
async fn test_timeout_maps_to_504() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");

    let response = router
        .oneshot(post_json(
            "/run_selection",
            json!({ "code": "hang", "session_id": session.session_id, "timeout": 1 }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = body_json(response).await;
    assert_eq!(body["status"], "timeout");

    // Escalation killed the worker; the session reports dead.
    let detail = manager.get(&session.session_id).await.expect("get");
    assert_eq!(detail.state, statabridge_core::SessionState::Dead);
}

#[tokio::test]
async fn test_graphs_served_as_png() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");
    let result = manager
        .run_selection(
            &session.session_id,
            "makegraph scatter1",
            None,
            None,
            false,
        )
        .await
        .expect("run");
    assert_eq!(result.graphs.len(), 1);

    let uri = format!("/graphs/scatter1?session_id={}", session.session_id);
    let response = router.clone().oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).expect("type"),
        "image/png"
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert!(bytes.starts_with(b"\x89PNG"));

    let uri = format!("/graphs/absent?session_id={}", session.session_id);
    let response = router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_view_data_endpoint() {
    let dataset = ScriptedDataset {
        csv: "price,make\n4099,\"AMC Concord\"\n4749,\"AMC Pacer\"\n".to_string(),
        total_rows: 2,
        variables: vec!["price|float|%9.0g|Price".to_string()],
    };
    let (router, _manager) = bridge_with_dataset(test_config(), dataset);

    let response = router
        .clone()
        .oneshot(get("/view_data?max_rows=10"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["displayed_rows"], 2);
    assert_eq!(body["total_rows"], 2);
    assert_eq!(body["columns"][0]["name"], "price");
    assert_eq!(body["columns"][0]["values"][0], 4099);

    // The if-condition is pushed down and narrows the snapshot.
    let response = router
        .clone()
        .oneshot(get("/view_data?if_condition=price%3E4500&max_rows=10"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["displayed_rows"], 1);
    assert_eq!(body["total_rows"], 1);
    assert_eq!(body["columns"][0]["values"][0], 4749);

    // Predicates with statement separators are rejected up front.
    let response = router
        .oneshot(get("/view_data?if_condition=price%3E0%3B%20rm"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_introspect_endpoint() {
    let dataset = ScriptedDataset {
        csv: String::new(),
        total_rows: 74,
        variables: vec![
            "price|float|%9.0g|Price".to_string(),
            "mpg|int|%8.0g|Mileage".to_string(),
        ],
    };
    let (router, _manager) = bridge_with_dataset(test_config(), dataset);

    let response = router.oneshot(get("/introspect")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["obs_count"], 74);
    assert_eq!(body["var_count"], 2);
    assert_eq!(body["variables"][1]["name"], "mpg");
}

#[tokio::test]
async fn test_single_session_mode_targets_one_session() {
    let mut config = test_config();
    config.multi_session = false;
    let (router, manager) = bridge(config);

    let response = router
        .clone()
        .oneshot(post_json("/run_selection", json!({ "code": "display 1" })))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(post_json(
            "/run_selection",
            json!({ "code": "display 2", "session_id": "anything-goes" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(manager.list().await.len(), 1);
}

#[tokio::test]
async fn test_capacity_is_service_unavailable() {
    let mut config = test_config();
    config.max_sessions = 1;
    let (router, manager) = bridge(config);
    manager.create_session().await.expect("first");

    let response = router
        .oneshot(post_json("/sessions", json!({})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "capacity");
}

#[tokio::test]
async fn test_run_selection_stream_emits_frames_and_done() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");

    let uri = format!(
        "/run_selection/stream?code=display%2042&session_id={}",
        session.session_id
    );
    let response = router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // The stream closes itself after the final frame.
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("Starting execution"), "stream: {text}");
    assert!(text.contains("\"kind\":\"stdout\""), "stream: {text}");
    assert!(text.contains("\"kind\":\"done\""), "stream: {text}");
    assert!(text.contains("\"status\":\"success\""), "stream: {text}");
}

#[tokio::test]
async fn test_stream_requires_code() {
    let (router, _manager) = bridge(test_config());
    let response = router
        .oneshot(get("/run_selection/stream"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_abandoned_stream_does_not_cancel_the_run() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");

    let uri = format!(
        "/run_selection/stream?code=makegraph%20g9%0Asleep%20300&session_id={}",
        session.session_id
    );
    let response = router.oneshot(get(&uri)).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    // Drop the body without reading it: the client went away.
    drop(response);

    // The run still completes and publishes its graphs.
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if !manager.graphs().list(&session.session_id).await.is_empty() {
            break;
        }
    }
    let names: Vec<String> = manager
        .graphs()
        .list(&session.session_id)
        .await
        .into_iter()
        .map(|g| g.name)
        .collect();
    assert_eq!(names, vec!["g9"]);
    let detail = manager.get(&session.session_id).await.expect("get");
    assert_eq!(detail.state, statabridge_core::SessionState::Ready);
}

#[tokio::test]
async fn test_restart_endpoint() {
    let (router, manager) = bridge(test_config());
    let session = manager.create_session().await.expect("create");

    let response = router
        .oneshot(post_json(
            "/sessions/restart",
            json!({ "session_id": session.session_id }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["restarted"], true);

    let detail = manager.get(&session.session_id).await.expect("get");
    assert_eq!(detail.state, statabridge_core::SessionState::Ready);
}
