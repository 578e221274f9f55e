//! HTTP/SSE surface for the Stata bridge
//!
//! Serves the execution API, SSE run streaming, graph artifacts, and the
//! MCP adapter (legacy SSE transport and Streamable HTTP) over one axum
//! router. All state lives in the core crate's [`SessionManager`]; this
//! crate is plumbing.
//!
//! # Endpoints
//!
//! - **Execution**: `POST /run_selection`, `GET /run_file`,
//!   `POST /stop_execution`, `GET /execution_status`
//! - **Streaming**: `GET /run_selection/stream`, `GET /run_file/stream`
//! - **Sessions**: `POST|GET /sessions`, `GET|DELETE /sessions/:id`,
//!   `POST /sessions/restart`
//! - **Data**: `GET /view_data`, `GET /introspect`, `GET /graphs/:name`
//! - **MCP**: `GET /mcp` + `POST /mcp/messages`, `POST /mcp-streamable`,
//!   `POST /v1/tools`
//! - **Health**: `GET /health`
//!
//! # Usage
//!
//! ```ignore
//! use statabridge_http::HttpServer;
//!
//! let server = HttpServer::new(manager);
//! let listener = server.bind().await?;
//! server.serve(listener, shutdown_signal).await?;
//! ```

pub mod error;
pub mod graphs;
pub mod handlers;
pub mod mcp;
pub mod server;
pub mod state;
pub mod stream;

// Re-export main types
pub use error::{ApiError, ApiResult};
pub use server::HttpServer;
pub use state::AppState;
