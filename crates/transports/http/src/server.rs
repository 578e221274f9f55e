//! HTTP server assembly
//!
//! Builds the router over all endpoints and runs it on a local listener.
//! The bind port is probed forward unless the configuration pins it.

use axum::routing::{delete, get, post};
use axum::Router;
use statabridge_core::SessionManager;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::{graphs, handlers, mcp, stream};

/// Ports probed beyond the configured one when it is taken.
const PORT_PROBE_RANGE: u16 = 10;

/// HTTP server over a session manager
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a server over the given manager
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            state: AppState::new(manager),
        }
    }

    /// Build the router with all endpoints
    pub fn build_router(&self) -> Router {
        Router::new()
            // Execution API
            .route("/run_selection", post(handlers::run_selection))
            .route("/run_selection/stream", get(stream::run_selection_stream))
            .route("/run_file", get(handlers::run_file))
            .route("/run_file/stream", get(stream::run_file_stream))
            .route("/stop_execution", post(handlers::stop_execution))
            .route("/execution_status", get(handlers::execution_status))
            // Session CRUD
            .route("/sessions", post(handlers::create_session))
            .route("/sessions", get(handlers::list_sessions))
            .route("/sessions/restart", post(handlers::restart_session))
            .route("/sessions/:id", get(handlers::get_session))
            .route("/sessions/:id", delete(handlers::delete_session))
            // Data and artifacts
            .route("/view_data", get(handlers::view_data))
            .route("/introspect", get(handlers::introspect))
            .route("/graphs/:name", get(graphs::get_graph))
            .route("/health", get(handlers::health))
            // MCP surface
            .route("/v1/tools", post(mcp::invoke_tool))
            .route("/mcp", get(mcp::sse::open_stream))
            .route("/mcp/messages", post(mcp::sse::post_message))
            .route(
                "/mcp-streamable",
                post(mcp::streamable::handle).get(mcp::streamable::reject_get),
            )
            .with_state(self.state.clone())
            .layer(
                tower::ServiceBuilder::new()
                    .layer(tower_http::trace::TraceLayer::new_for_http())
                    .layer(tower_http::cors::CorsLayer::permissive()),
            )
    }

    /// Bind the listener, probing past a taken port unless pinned.
    pub async fn bind(&self) -> ApiResult<tokio::net::TcpListener> {
        let config = self.state.manager.config();
        let host = config.host.clone();
        let candidates: Vec<u16> = if config.force_port {
            vec![config.port]
        } else {
            (0..=PORT_PROBE_RANGE)
                .filter_map(|i| config.port.checked_add(i))
                .collect()
        };

        for port in &candidates {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|err| {
                    ApiError::Core(statabridge_core::Error::BadRequest(format!(
                        "invalid bind address {host}:{port} ({err})"
                    )))
                })?;
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if *port != config.port {
                        tracing::warn!(
                            configured = config.port,
                            bound = port,
                            "configured port was taken, moved forward"
                        );
                    }
                    return Ok(listener);
                }
                Err(err) => {
                    tracing::debug!(%addr, %err, "bind attempt failed");
                }
            }
        }

        Err(ApiError::Core(statabridge_core::Error::Internal(format!(
            "no free port in {}..={}",
            config.port,
            candidates.last().copied().unwrap_or(config.port)
        ))))
    }

    /// Run until the shutdown future resolves.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> ApiResult<()> {
        let addr = listener
            .local_addr()
            .map_err(statabridge_core::Error::from)?;
        tracing::info!(%addr, "bridge server listening");

        let router = self.build_router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|err| {
                ApiError::Core(statabridge_core::Error::Internal(format!(
                    "server error: {err}"
                )))
            })?;
        Ok(())
    }
}
