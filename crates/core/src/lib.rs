//! Core runtime for the Stata bridge
//!
//! Transport-agnostic execution engine: named sessions, one dedicated
//! Engine worker process per session, serialized interpreter access with
//! cooperative break and wall-clock timeout escalation, output filtering
//! with a token budget, and per-session graph registries.
//!
//! The HTTP/SSE/MCP surface lives in the transport crate; everything here
//! is driven through [`SessionManager`].
//!
//! # Usage
//!
//! ```ignore
//! use statabridge_core::{ServerConfig, SessionManager};
//! use statabridge_core::worker::console::ConsoleFactory;
//! use std::sync::Arc;
//!
//! let config = ServerConfig::default();
//! let factory = Arc::new(ConsoleFactory::new(Arc::new(config.clone())));
//! let manager = SessionManager::new(config, factory);
//! manager.start_sweeper();
//!
//! let session = manager.create_session().await?;
//! let result = manager
//!     .run_selection(&session.session_id, "display 42", None, None, false)
//!     .await?;
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod filter;
pub mod graphs;
pub mod normalize;
pub mod protocol;
pub mod session;
pub mod worker;

// Re-export main types
pub use config::{DisplayMode, EngineEdition, LogFileLocation, ServerConfig};
pub use error::{Error, Result};
pub use graphs::GraphRegistry;
pub use protocol::{
    DatasetColumn, DatasetInfo, DatasetView, DoneSummary, EngineHealth, FrameKind, GraphRef,
    Reply, Request, RunResult, RunStatus, StreamFrame, VariableInfo,
};
pub use session::manager::{ExecutionStatus, StopOutcome};
pub use session::{SessionManager, SessionState, SessionSummary};
pub use worker::WorkerHandle;
