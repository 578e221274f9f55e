//! Request/response types exchanged with Engine workers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::oneshot;

use crate::Result;

/// A request submitted to a session's worker
#[derive(Debug, Clone)]
pub enum Request {
    /// Run a code fragment (editor selection or ad-hoc command)
    RunSelection {
        /// Code to execute; continuation lines are joined before submission
        code: String,
        /// Working directory for the run, if different from the worker's
        working_dir: Option<PathBuf>,
        /// Wall-clock limit in seconds
        timeout: u64,
        /// Bypass the compact output filter for this run
        skip_filter: bool,
    },

    /// Run a whole script file via the interpreter's `do` mechanism
    RunFile {
        /// Absolute path of the script
        path: PathBuf,
        /// Working directory for the run
        working_dir: Option<PathBuf>,
        /// Wall-clock limit in seconds
        timeout: u64,
    },

    /// Cooperative interrupt; a no-op when nothing is running
    Break,

    /// Tear down and re-initialize the Engine in place, wiping all
    /// interpreter state and truncating the session log
    Restart,

    /// Tabular snapshot of the in-memory dataset
    ViewData {
        /// Engine-side filter predicate pushed down to the interpreter
        if_condition: Option<String>,
        /// Row ceiling for the returned snapshot
        max_rows: usize,
    },

    /// Dataset shape without values: observation count and variable list
    Introspect,
}

impl Request {
    /// Wall-clock limit for this request, if it carries one
    pub fn timeout(&self) -> Option<u64> {
        match self {
            Request::RunSelection { timeout, .. } | Request::RunFile { timeout, .. } => {
                Some(*timeout)
            }
            _ => None,
        }
    }
}

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The command completed without an interpreter error
    Success,
    /// The Engine executed the command and reported an error
    Error,
    /// A cooperative break succeeded
    Cancelled,
    /// The wall-clock limit was exceeded
    Timeout,
}

impl RunStatus {
    /// String representation used in wire payloads and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Timeout => "timeout",
        }
    }
}

/// Reference to an image artifact exported by a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRef {
    /// Engine-side graph name, unique per session
    pub name: String,
    /// Absolute path of the exported PNG, forward slashes on every host OS
    pub path: String,
    /// Export time
    pub created_at: DateTime<Utc>,
    /// Position within the run's export batch
    pub sequence: usize,
}

impl GraphRef {
    /// Registry URL for this graph, with the name percent-encoded
    pub fn url(&self) -> String {
        format!("/graphs/{}", encode_name(&self.name))
    }
}

/// Percent-encode a graph name for use in a URL path segment.
fn encode_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Result of a run request
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Terminal status
    pub status: RunStatus,
    /// Interpreter output (raw from the worker; the dispatch layer applies
    /// the configured output filter and token budget)
    pub output: String,
    /// The session log that captured this run
    pub log_path: String,
    /// Graphs exported by this run; empty unless `status` is success
    pub graphs: Vec<GraphRef>,
    /// When the token budget spilled the output, the file holding the
    /// unbounded text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_to_file: Option<String>,
    /// Whether timeout escalation killed the worker; the session must be
    /// recreated. Not part of the wire payload.
    #[serde(skip)]
    pub worker_dead: bool,
}

impl RunResult {
    /// Result shell for a run that produced `output` with `status`
    pub fn new(status: RunStatus, output: String, log_path: String) -> Self {
        Self {
            status,
            output,
            log_path,
            graphs: Vec::new(),
            truncated_to_file: None,
            worker_dead: false,
        }
    }
}

/// One variable's worth of data in a column-major dataset snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetColumn {
    /// Variable name
    pub name: String,
    /// Cell values; numeric where the Engine stored numbers, null for
    /// missing values
    pub values: Vec<serde_json::Value>,
}

/// Column-major snapshot of the in-memory dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetView {
    /// Columns in dataset order
    pub columns: Vec<DatasetColumn>,
    /// Rows actually included in `columns`
    pub displayed_rows: usize,
    /// Rows matching the predicate (before the ceiling was applied)
    pub total_rows: usize,
    /// The ceiling that was applied
    pub max_rows: usize,
}

/// One variable's metadata, from `Introspect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    /// Variable name
    pub name: String,
    /// Storage type (e.g. `float`, `str14`)
    pub var_type: String,
    /// Display format
    pub format: String,
    /// Variable label, empty when unset
    pub label: String,
}

/// Dataset shape without values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Observation count
    pub obs_count: u64,
    /// Variable count
    pub var_count: u64,
    /// Per-variable metadata
    pub variables: Vec<VariableInfo>,
}

/// Engine availability, as reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Whether the worker has a live, initialized Engine
    pub engine_available: bool,
    /// Interpreter version string, empty when unavailable
    pub version: String,
    /// Edition tag (`mp`, `se`, `be`)
    pub edition: String,
}

/// Frame pushed on an SSE run stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamFrame {
    /// Frame kind
    pub kind: FrameKind,
    /// Line text for `status`/`stdout`/`error` frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Structured summary attached to the final `done` frame
    #[serde(flatten)]
    pub summary: Option<DoneSummary>,
}

/// Stream frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// Run boundary marker
    Status,
    /// One interpreter output line
    Stdout,
    /// Terminal stream error
    Error,
    /// Final frame before close
    Done,
}

/// Minimal structured summary carried by the final `done` frame
#[derive(Debug, Clone, Serialize)]
pub struct DoneSummary {
    /// Terminal status of the run
    pub status: RunStatus,
    /// Graph names exported by the run
    pub graphs: Vec<String>,
    /// Session log path
    pub log_path: String,
}

impl StreamFrame {
    /// A `status` frame
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Status,
            text: Some(text.into()),
            summary: None,
        }
    }

    /// A `stdout` frame
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Stdout,
            text: Some(text.into()),
            summary: None,
        }
    }

    /// A terminal `error` frame
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Error,
            text: Some(text.into()),
            summary: None,
        }
    }

    /// The final `done` frame
    pub fn done(result: &RunResult) -> Self {
        Self {
            kind: FrameKind::Done,
            text: None,
            summary: Some(DoneSummary {
                status: result.status,
                graphs: result.graphs.iter().map(|g| g.name.clone()).collect(),
                log_path: result.log_path.clone(),
            }),
        }
    }
}

/// Reply payload for a worker request
#[derive(Debug)]
pub enum Reply {
    /// Run outcome
    Run(RunResult),
    /// Dataset snapshot
    Dataset(DatasetView),
    /// Dataset shape
    Introspect(DatasetInfo),
    /// Acknowledgement for `Break`/`Restart`
    Ack,
}

/// Envelope pairing a request with its response channel
#[derive(Debug)]
pub struct WorkerRequest {
    /// The request
    pub request: Request,
    /// Response channel; the worker ignores a dropped receiver
    pub reply: oneshot::Sender<Result<Reply>>,
}
