//! Execution API handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use statabridge_core::{Error, RunResult, RunStatus};
use std::path::PathBuf;

use crate::error::ApiResult;
use crate::state::AppState;

/// Body of `POST /run_selection`
#[derive(Debug, Default, Deserialize)]
pub struct RunSelectionBody {
    /// Code fragment to execute
    pub code: Option<String>,
    /// Target session; defaults to the implicit session
    pub session_id: Option<String>,
    /// Working directory for the run
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit in seconds
    pub timeout: Option<u64>,
    /// Bypass the compact output filter
    pub skip_filter: Option<bool>,
}

/// Query of `GET /run_file`
#[derive(Debug, Deserialize)]
pub struct RunFileQuery {
    /// Script to execute
    pub file_path: Option<PathBuf>,
    /// Target session
    pub session_id: Option<String>,
    /// Working directory for the run
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit in seconds
    pub timeout: Option<u64>,
}

/// Parameters common to endpoints that only target a session
#[derive(Debug, Default, Deserialize)]
pub struct SessionScope {
    /// Target session; defaults to the implicit session
    pub session_id: Option<String>,
}

/// Query of `GET /view_data`
#[derive(Debug, Deserialize)]
pub struct ViewDataQuery {
    /// Target session
    pub session_id: Option<String>,
    /// Filter predicate pushed down to the Engine
    pub if_condition: Option<String>,
    /// Row ceiling for the snapshot
    pub max_rows: Option<usize>,
}

/// Wrap a run result: engine-level failures stay HTTP 200, timeouts map
/// to 504.
fn run_response(session_id: &str, result: RunResult) -> ApiResult<Response> {
    let status = if result.status == RunStatus::Timeout {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::OK
    };
    let mut body = serde_json::to_value(&result).map_err(Error::from)?;
    body["session_id"] = json!(session_id);
    Ok((status, Json(body)).into_response())
}

/// POST /run_selection - synchronous code fragment execution
pub async fn run_selection(
    State(state): State<AppState>,
    Json(body): Json<RunSelectionBody>,
) -> ApiResult<Response> {
    let code = body
        .code
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("code is required".to_string()))?;
    let session_id = state.manager.resolve(body.session_id.as_deref()).await?;
    let result = state
        .manager
        .run_selection(
            &session_id,
            &code,
            body.working_dir,
            body.timeout,
            body.skip_filter.unwrap_or(false),
        )
        .await?;
    run_response(&session_id, result)
}

/// GET /run_file - synchronous script execution
pub async fn run_file(
    State(state): State<AppState>,
    Query(query): Query<RunFileQuery>,
) -> ApiResult<Response> {
    let path = query
        .file_path
        .ok_or_else(|| Error::BadRequest("file_path is required".to_string()))?;
    let session_id = state.manager.resolve(query.session_id.as_deref()).await?;
    let result = state
        .manager
        .run_file(&session_id, path, query.working_dir, query.timeout)
        .await?;
    run_response(&session_id, result)
}

/// POST /stop_execution - request a break on the active run
///
/// Never fatal to the session; clients that abandoned an SSE stream call
/// this to actually cancel the engine.
pub async fn stop_execution(
    State(state): State<AppState>,
    body: Option<Json<SessionScope>>,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = body.map(|Json(scope)| scope).unwrap_or_default();
    let session_id = state.manager.resolve(scope.session_id.as_deref()).await?;
    let outcome = state.manager.stop(&session_id).await?;
    Ok(Json(json!({
        "result": outcome,
        "session_id": session_id,
    })))
}

/// GET /execution_status - state of the session's in-flight request
pub async fn execution_status(
    State(state): State<AppState>,
    Query(scope): Query<SessionScope>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = state.manager.resolve(scope.session_id.as_deref()).await?;
    let status = state.manager.execution_status(&session_id).await?;
    Ok(Json(serde_json::to_value(status).map_err(Error::from)?))
}

/// POST /sessions - create a session
pub async fn create_session(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let summary = state.manager.create_session().await?;
    Ok(Json(serde_json::to_value(summary).map_err(Error::from)?))
}

/// GET /sessions - list sessions
pub async fn list_sessions(
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut sessions = state.manager.list().await;
    sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(Json(json!({
        "sessions": sessions,
        "multi_session": state.manager.config().multi_session,
    })))
}

/// GET /sessions/:id - session detail
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = state.manager.resolve(Some(&id)).await?;
    let summary = state.manager.get(&session_id).await?;
    Ok(Json(serde_json::to_value(summary).map_err(Error::from)?))
}

/// DELETE /sessions/:id - destroy a session (idempotent)
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.manager.destroy(&id).await?;
    Ok(Json(json!({ "session_id": id, "deleted": true })))
}

/// POST /sessions/restart - restart the session's worker in place
pub async fn restart_session(
    State(state): State<AppState>,
    body: Option<Json<SessionScope>>,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = body.map(|Json(scope)| scope).unwrap_or_default();
    let session_id = state.manager.resolve(scope.session_id.as_deref()).await?;
    state.manager.restart(&session_id).await?;
    Ok(Json(json!({ "session_id": session_id, "restarted": true })))
}

/// GET /view_data - tabular snapshot of the in-memory dataset
pub async fn view_data(
    State(state): State<AppState>,
    Query(query): Query<ViewDataQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = state.manager.resolve(query.session_id.as_deref()).await?;
    let view = state
        .manager
        .view_data(&session_id, query.if_condition, query.max_rows)
        .await?;
    let mut body = serde_json::to_value(view).map_err(Error::from)?;
    body["session_id"] = json!(session_id);
    Ok(Json(body))
}

/// GET /introspect - dataset shape without values
pub async fn introspect(
    State(state): State<AppState>,
    Query(scope): Query<SessionScope>,
) -> ApiResult<Json<serde_json::Value>> {
    let session_id = state.manager.resolve(scope.session_id.as_deref()).await?;
    let info = state.manager.introspect(&session_id).await?;
    let mut body = serde_json::to_value(info).map_err(Error::from)?;
    body["session_id"] = json!(session_id);
    Ok(Json(body))
}

/// GET /health - server and engine availability
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engine = state.manager.engine_health().await.unwrap_or_else(|err| {
        tracing::warn!(%err, "health probe could not reach an engine");
        statabridge_core::EngineHealth {
            engine_available: false,
            version: String::new(),
            edition: state.manager.config().stata_edition.as_str().to_string(),
        }
    });
    let active = state.manager.active_sessions().await;
    Json(json!({
        "ok": true,
        "engine_available": engine.engine_available,
        "version": engine.version,
        "edition": engine.edition,
        "active_sessions": active,
        "max_sessions": state.manager.config().max_sessions,
    }))
}
