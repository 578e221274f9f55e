//! SSE run streaming
//!
//! The streaming endpoints open the event stream first, start the run
//! asynchronously, and tail the session log while it progresses. A client
//! that drops the stream does not cancel the run; cancellation is a
//! separate `POST /stop_execution`.

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Deserialize;
use statabridge_core::{Error, RunResult, SessionManager, StreamFrame};
use std::convert::Infallible;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt as _;

use crate::error::ApiResult;
use crate::state::AppState;

/// Log poll throttle for SSE tails.
const TAIL_POLL: Duration = Duration::from_millis(150);

/// Query of the streaming run endpoints
#[derive(Debug, Deserialize)]
pub struct StreamRunQuery {
    /// Code fragment (`/run_selection/stream`)
    pub code: Option<String>,
    /// Script path (`/run_file/stream`)
    pub file_path: Option<PathBuf>,
    /// Target session
    pub session_id: Option<String>,
    /// Working directory for the run
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit in seconds
    pub timeout: Option<u64>,
    /// Bypass the compact output filter (`/run_selection/stream`)
    pub skip_filter: Option<bool>,
}

/// Incremental reader over the session log.
///
/// Tracks a byte offset and yields only complete new lines; a partially
/// written trailing line stays buffered until its newline arrives. CRLF is
/// normalized to LF.
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
}

impl LogTailer {
    /// Tail `path` starting at `offset`
    pub fn new(path: PathBuf, offset: u64) -> Self {
        Self { path, offset }
    }

    /// Current length of `path`, used to skip history before a run
    pub fn current_len(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    /// New complete lines since the last poll
    pub fn read_new(&mut self) -> Vec<String> {
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len < self.offset {
            // Truncated (restart); start over from the top.
            self.offset = 0;
        }
        if len == self.offset {
            return Vec::new();
        }
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }

        let mut buffer = String::new();
        if file.read_to_string(&mut buffer).is_err() {
            return Vec::new();
        }

        // Only consume up to the last complete line.
        let consumed = match buffer.rfind('\n') {
            Some(pos) => pos + 1,
            None => return Vec::new(),
        };
        self.offset += consumed as u64;

        buffer[..consumed]
            .split('\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect()
    }
}

/// Map one log line to its stream frame kind.
fn classify(line: &str) -> StreamFrame {
    if line.starts_with("*** ") {
        StreamFrame::status(line)
    } else {
        StreamFrame::stdout(line)
    }
}

enum RunKind {
    Selection {
        code: String,
        skip_filter: bool,
    },
    File {
        path: PathBuf,
    },
}

/// GET /run_selection/stream - SSE-streamed code fragment execution
pub async fn run_selection_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamRunQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let code = query
        .code
        .clone()
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| Error::BadRequest("code is required".to_string()))?;
    let kind = RunKind::Selection {
        code,
        skip_filter: query.skip_filter.unwrap_or(false),
    };
    open_run_stream(state, query, kind).await
}

/// GET /run_file/stream - SSE-streamed script execution
pub async fn run_file_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamRunQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let path = query
        .file_path
        .clone()
        .ok_or_else(|| Error::BadRequest("file_path is required".to_string()))?;
    open_run_stream(state, query, RunKind::File { path }).await
}

async fn open_run_stream(
    state: AppState,
    query: StreamRunQuery,
    kind: RunKind,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    // Resolve before the stream opens so bad sessions are HTTP errors,
    // not stream frames.
    let session_id = state.manager.resolve(query.session_id.as_deref()).await?;
    let summary = state.manager.get(&session_id).await?;
    let offset = LogTailer::current_len(&summary.log_path);
    let tailer = LogTailer::new(summary.log_path.clone(), offset);

    let (frames_tx, frames_rx) = mpsc::channel::<StreamFrame>(64);
    tokio::spawn(drive_run(
        state.manager.clone(),
        session_id,
        kind,
        query.working_dir,
        query.timeout,
        tailer,
        frames_tx,
    ));

    let stream = ReceiverStream::new(frames_rx).map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Drive one streamed run: start it, tail the log, emit the final frame.
///
/// Send failures mean the client went away; the run keeps going so its
/// result still lands in the session (and the graph registry).
async fn drive_run(
    manager: Arc<SessionManager>,
    session_id: String,
    kind: RunKind,
    working_dir: Option<PathBuf>,
    timeout: Option<u64>,
    mut tailer: LogTailer,
    frames: mpsc::Sender<StreamFrame>,
) {
    let mut client_gone = frames
        .send(StreamFrame::status("Starting execution"))
        .await
        .is_err();

    let run = async {
        match kind {
            RunKind::Selection { code, skip_filter } => {
                manager
                    .run_selection(&session_id, &code, working_dir, timeout, skip_filter)
                    .await
            }
            RunKind::File { path } => {
                manager
                    .run_file(&session_id, path, working_dir, timeout)
                    .await
            }
        }
    };
    tokio::pin!(run);

    let mut poll = tokio::time::interval(TAIL_POLL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result: Result<RunResult, Error> = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = poll.tick() => {
                for line in tailer.read_new() {
                    if client_gone {
                        continue;
                    }
                    if frames.send(classify(&line)).await.is_err() {
                        client_gone = true;
                    }
                }
            }
        }
    };

    // Flush whatever the run wrote after the last poll.
    for line in tailer.read_new() {
        if client_gone {
            break;
        }
        if frames.send(classify(&line)).await.is_err() {
            client_gone = true;
        }
    }

    let final_frame = match &result {
        Ok(result) => StreamFrame::done(result),
        Err(err) => StreamFrame::error(err.to_string()),
    };
    let _ = frames.send(final_frame).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tailer_yields_only_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tailer = LogTailer::new(path.clone(), LogTailer::current_len(&path));
        assert!(tailer.read_new().is_empty());

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "fresh\npartial").unwrap();
        assert_eq!(tailer.read_new(), vec!["fresh"]);

        writeln!(file, " line").unwrap();
        assert_eq!(tailer.read_new(), vec!["partial line"]);
    }

    #[test]
    fn test_tailer_normalizes_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "a\r\nb\r\n").unwrap();

        let mut tailer = LogTailer::new(path.clone(), 0);
        assert_eq!(tailer.read_new(), vec!["a", "b"]);
    }

    #[test]
    fn test_tailer_handles_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(&path, "a long first generation\n").unwrap();

        let mut tailer = LogTailer::new(path.clone(), 0);
        tailer.read_new();

        // Restart truncates the log; the tailer starts over.
        std::fs::write(&path, "second\n").unwrap();
        assert_eq!(tailer.read_new(), vec!["second"]);
    }

    #[test]
    fn test_classify_markers_as_status() {
        assert!(matches!(
            classify("*** Execution started: t").kind,
            statabridge_core::FrameKind::Status
        ));
        assert!(matches!(
            classify("ordinary output").kind,
            statabridge_core::FrameKind::Stdout
        ));
    }
}
