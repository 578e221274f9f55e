//! Static serving of exported graph images

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::error::{ApiError, ApiResult};
use crate::handlers::SessionScope;
use crate::state::AppState;

/// GET /graphs/:name - PNG bytes of a registered graph
///
/// The name is the percent-decoded Engine graph name; the registry only
/// knows artifacts of the session's latest successful run.
pub async fn get_graph(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(scope): Query<SessionScope>,
) -> ApiResult<Response> {
    let session_id = state.manager.resolve(scope.session_id.as_deref()).await?;
    let graph = state
        .manager
        .graphs()
        .resolve(&session_id, &name)
        .await
        .ok_or_else(|| ApiError::GraphNotFound(name.clone()))?;

    let bytes = tokio::fs::read(&graph.path).await.map_err(|err| {
        tracing::warn!(name = %graph.name, path = %graph.path, %err, "graph file unreadable");
        ApiError::GraphNotFound(name)
    })?;

    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}
