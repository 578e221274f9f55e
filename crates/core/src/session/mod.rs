//! Session identity and lifecycle types

pub mod manager;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

pub use manager::{SessionManager, StopOutcome};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Idle, accepting requests
    Ready,
    /// A request is in flight
    Busy,
    /// Being destroyed or restarted; rejects requests and cannot come back
    /// to `Ready` through dispatch
    Terminating,
    /// Worker crashed or was killed; the session must be recreated
    Dead,
}

impl SessionState {
    /// String representation used in wire payloads and error messages
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Ready => "ready",
            SessionState::Busy => "busy",
            SessionState::Terminating => "terminating",
            SessionState::Dead => "dead",
        }
    }
}

/// Point-in-time session description served by the sessions API
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Opaque, time-ordered session id
    pub session_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last dispatch acceptance time
    pub last_used_at: DateTime<Utc>,
    /// Current state
    pub state: SessionState,
    /// Worker working directory
    pub working_dir: PathBuf,
    /// Per-session log path tailed by SSE streams
    pub log_path: PathBuf,
}

/// Generate a new opaque session id.
///
/// A lowercase hex millisecond timestamp prefix keeps ids sortable by
/// creation time; the uuid suffix keeps them unique within a millisecond.
pub fn new_session_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{millis:012x}{}", &suffix[..8])
}
