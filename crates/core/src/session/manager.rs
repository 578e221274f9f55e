//! Session lifecycle and request dispatch
//!
//! The session table is the only shared mutable state in the core. Reads
//! are lock-and-clone; no lock is held across an await that touches a
//! worker.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{new_session_id, SessionState, SessionSummary};
use crate::config::{DisplayMode, ServerConfig};
use crate::filter;
use crate::graphs::GraphRegistry;
use crate::normalize::join_continuations;
use crate::protocol::{
    DatasetInfo, DatasetView, EngineHealth, Reply, Request, RunResult, RunStatus,
};
use crate::worker::console::forward_slashes;
use crate::worker::{BackendFactory, WorkerHandle};
use crate::{Error, Result};

/// How long `stop_execution` waits for the break to land before reporting
/// `stop_requested` instead of `stopped`.
const STOP_WAIT: Duration = Duration::from_millis(1500);

/// Outcome of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The in-flight run completed after the break
    Stopped,
    /// The break was signalled; the run has not finished yet
    StopRequested,
    /// Nothing was running
    NoExecution,
}

/// Current execution state of a session
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStatus {
    /// Session state at sampling time
    pub state: SessionState,
    /// The session sampled
    pub session_id: String,
    /// Milliseconds the in-flight request has been running, 0 when idle
    pub elapsed_ms: u64,
}

struct SessionEntry {
    created_at: chrono::DateTime<Utc>,
    last_used_at: chrono::DateTime<Utc>,
    state: SessionState,
    working_dir: PathBuf,
    log_path: PathBuf,
    worker: WorkerHandle,
    busy_since: Option<Instant>,
}

impl SessionEntry {
    fn summary(&self, session_id: &str) -> SessionSummary {
        SessionSummary {
            session_id: session_id.to_string(),
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            state: self.state,
            working_dir: self.working_dir.clone(),
            log_path: self.log_path.clone(),
        }
    }
}

/// Owns every session and serializes access to each session's worker
pub struct SessionManager {
    config: Arc<ServerConfig>,
    factory: Arc<dyn BackendFactory>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    graphs: GraphRegistry,
    default_session: Mutex<Option<String>>,
}

impl SessionManager {
    /// Create a manager over the given configuration and engine factory
    pub fn new(config: ServerConfig, factory: Arc<dyn BackendFactory>) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            factory,
            sessions: RwLock::new(HashMap::new()),
            graphs: GraphRegistry::new(),
            default_session: Mutex::new(None),
        })
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Graph registry fed by successful runs
    pub fn graphs(&self) -> &GraphRegistry {
        &self.graphs
    }

    /// Spawn the idle-eviction sweeper. The sweeper exits when the manager
    /// is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.session_timeout.clamp(1, 60));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.evict_idle().await;
            }
        })
    }

    /// Create a new session with a freshly spawned worker.
    pub async fn create_session(&self) -> Result<SessionSummary> {
        let mut sessions = self.sessions.write().await;
        let live = sessions
            .values()
            .filter(|entry| entry.state != SessionState::Dead)
            .count();
        if live >= self.config.max_sessions {
            return Err(Error::Capacity(live));
        }

        let session_id = new_session_id();
        let working_dir = self
            .config
            .workspace_root
            .clone()
            .unwrap_or_else(|| self.config.state_dir.join("work").join(&session_id));
        let worker = WorkerHandle::spawn(
            session_id.clone(),
            self.config.clone(),
            self.factory.clone(),
            working_dir.clone(),
        );

        let now = Utc::now();
        let entry = SessionEntry {
            created_at: now,
            last_used_at: now,
            state: SessionState::Ready,
            working_dir,
            log_path: self.config.session_log_path(&session_id),
            worker,
            busy_since: None,
        };
        let summary = entry.summary(&session_id);
        sessions.insert(session_id.clone(), entry);
        tracing::info!(%session_id, "session created");
        Ok(summary)
    }

    /// Resolve a request's optional `session_id` to a concrete session.
    ///
    /// With multi-session disabled every request lands on the single
    /// implicit session, whatever id was passed. With it enabled, a
    /// missing id targets the implicit default session.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<String> {
        if self.config.multi_session {
            if let Some(id) = requested.filter(|id| !id.is_empty()) {
                return if self.sessions.read().await.contains_key(id) {
                    Ok(id.to_string())
                } else {
                    Err(Error::SessionNotFound(id.to_string()))
                };
            }
        }
        self.default_session().await
    }

    async fn default_session(&self) -> Result<String> {
        let mut slot = self.default_session.lock().await;
        if let Some(id) = slot.as_ref() {
            let alive = self
                .sessions
                .read()
                .await
                .get(id)
                .is_some_and(|entry| entry.state != SessionState::Dead);
            if alive {
                return Ok(id.clone());
            }
        }
        let summary = self.create_session().await?;
        *slot = Some(summary.session_id.clone());
        Ok(summary.session_id)
    }

    /// Session detail
    pub async fn get(&self, session_id: &str) -> Result<SessionSummary> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|entry| entry.summary(session_id))
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// All sessions, unordered
    pub async fn list(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| entry.summary(id))
            .collect()
    }

    /// Destroy a session. Idempotent: destroying an unknown id succeeds.
    pub async fn destroy(&self, session_id: &str) -> Result<()> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.state = SessionState::Terminating;
            }
            sessions.remove(session_id)
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        // Break any in-flight run; dropping the handle closes the request
        // queue and the driver tears the engine down after the current
        // request.
        entry.worker.request_break().await;
        drop(entry);

        self.graphs.remove_session(session_id).await;
        let mut slot = self.default_session.lock().await;
        if slot.as_deref() == Some(session_id) {
            *slot = None;
        }
        tracing::info!(%session_id, "session destroyed");
        Ok(())
    }

    /// Destroy every session (server shutdown).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.destroy(&id).await;
        }
    }

    /// Evict sessions idle past the configured timeout.
    ///
    /// Eviction is monotonic: a session is flipped to `terminating` under
    /// the table lock before any teardown, so it can never accept another
    /// request.
    pub async fn evict_idle(&self) {
        let timeout = self.config.session_timeout as i64;
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let mut expired = Vec::new();
            for (id, entry) in sessions.iter_mut() {
                let idle_secs = (now - entry.last_used_at).num_seconds();
                let evictable =
                    matches!(entry.state, SessionState::Ready | SessionState::Dead);
                if evictable && idle_secs >= timeout {
                    entry.state = SessionState::Terminating;
                    expired.push(id.clone());
                }
            }
            expired
        };
        for session_id in expired {
            tracing::info!(%session_id, "session evicted after idle timeout");
            let _ = self.destroy(&session_id).await;
        }
    }

    /// Forward a request to a session's worker.
    ///
    /// Atomically requires `ready`, flips to `busy`, and stamps
    /// `last_used_at` at acceptance. The state is restored to `ready`
    /// afterwards unless the worker died.
    pub async fn dispatch(&self, session_id: &str, request: Request) -> Result<Reply> {
        let worker = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            match entry.state {
                SessionState::Ready => {}
                SessionState::Dead => {
                    return Err(Error::WorkerDead(format!(
                        "session {session_id} is dead; create a new session"
                    )))
                }
                state => {
                    return Err(Error::SessionBusy {
                        id: session_id.to_string(),
                        state: state.as_str().to_string(),
                    })
                }
            }
            entry.state = SessionState::Busy;
            entry.last_used_at = Utc::now();
            entry.busy_since = Some(Instant::now());
            entry.worker.clone()
        };

        let reply = worker.submit(request).await;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(entry) = sessions.get_mut(session_id) {
                entry.busy_since = None;
                let worker_died = matches!(&reply, Err(Error::WorkerDead(_)))
                    || matches!(&reply, Ok(Reply::Run(run)) if run.worker_dead);
                if worker_died {
                    entry.state = SessionState::Dead;
                } else if entry.state == SessionState::Busy {
                    entry.state = SessionState::Ready;
                }
            }
        }

        reply
    }

    /// Run a code fragment on a session and post-process the result.
    pub async fn run_selection(
        &self,
        session_id: &str,
        code: &str,
        working_dir: Option<PathBuf>,
        timeout: Option<u64>,
        skip_filter: bool,
    ) -> Result<RunResult> {
        let code = join_continuations(code);
        if code.trim().is_empty() {
            return Err(Error::BadRequest("no code to run".to_string()));
        }
        let request = Request::RunSelection {
            code,
            working_dir,
            timeout: timeout.unwrap_or(self.config.default_run_timeout),
            skip_filter,
        };
        let reply = self.dispatch(session_id, request).await?;
        let Reply::Run(result) = reply else {
            return Err(Error::Internal("worker returned a mismatched reply".into()));
        };
        self.finish_run(session_id, result, skip_filter).await
    }

    /// Run a script file on a session and post-process the result.
    pub async fn run_file(
        &self,
        session_id: &str,
        path: PathBuf,
        working_dir: Option<PathBuf>,
        timeout: Option<u64>,
    ) -> Result<RunResult> {
        if !path.is_file() {
            return Err(Error::BadRequest(format!(
                "file not found: {}",
                path.display()
            )));
        }
        let request = Request::RunFile {
            path,
            working_dir,
            timeout: timeout.unwrap_or(self.config.default_run_timeout),
        };
        let reply = self.dispatch(session_id, request).await?;
        let Reply::Run(result) = reply else {
            return Err(Error::Internal("worker returned a mismatched reply".into()));
        };
        self.finish_run(session_id, result, false).await
    }

    /// Apply the output filter and token budget, then publish graphs.
    async fn finish_run(
        &self,
        session_id: &str,
        mut result: RunResult,
        skip_filter: bool,
    ) -> Result<RunResult> {
        let filtered = if skip_filter || self.config.result_display_mode == DisplayMode::Full {
            result.output.clone()
        } else {
            filter::compact(&result.output)
        };

        let spill_dir = self.config.state_dir.join("logs");
        let run_id = format!("{session_id}_{}", uuid::Uuid::new_v4().simple());
        let (output, spilled) = filter::apply_token_budget(
            filtered,
            self.config.max_output_tokens,
            &spill_dir,
            &run_id,
        )?;
        result.output = output;
        result.truncated_to_file = spilled.map(|p| forward_slashes(&p));

        if result.status == RunStatus::Success {
            self.graphs
                .replace(session_id, result.graphs.clone())
                .await;
        }
        Ok(result)
    }

    /// Request a break of the session's in-flight run.
    ///
    /// Never fatal: a session with nothing running reports `no_execution`.
    pub async fn stop(&self, session_id: &str) -> Result<StopOutcome> {
        let worker = {
            let sessions = self.sessions.read().await;
            let entry = sessions
                .get(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            if entry.state != SessionState::Busy {
                return Ok(StopOutcome::NoExecution);
            }
            entry.worker.clone()
        };

        worker.request_break().await;

        // Give the break a moment to land so interactive callers usually
        // see the terminal answer.
        let deadline = Instant::now() + STOP_WAIT;
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let state = {
                let sessions = self.sessions.read().await;
                sessions.get(session_id).map(|entry| entry.state)
            };
            match state {
                Some(SessionState::Busy) => continue,
                _ => return Ok(StopOutcome::Stopped),
            }
        }
        Ok(StopOutcome::StopRequested)
    }

    /// Restart a session's engine in place, wiping interpreter state.
    pub async fn restart(&self, session_id: &str) -> Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
            match entry.state {
                SessionState::Ready => {}
                state => {
                    return Err(Error::SessionBusy {
                        id: session_id.to_string(),
                        state: state.as_str().to_string(),
                    })
                }
            }
            entry.state = SessionState::Terminating;
            entry.last_used_at = Utc::now();
        }

        let worker = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .map(|entry| entry.worker.clone())
                .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?
        };
        let outcome = worker.submit(Request::Restart).await;

        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.state = match &outcome {
                Err(Error::WorkerDead(_)) => SessionState::Dead,
                _ => SessionState::Ready,
            };
        }
        self.graphs.remove_session(session_id).await;
        outcome.map(|_| ())
    }

    /// Dataset snapshot with the predicate pushed down to the Engine.
    pub async fn view_data(
        &self,
        session_id: &str,
        if_condition: Option<String>,
        max_rows: Option<usize>,
    ) -> Result<DatasetView> {
        if let Some(cond) = if_condition.as_deref() {
            if cond.contains(['\n', '\r', ';']) {
                return Err(Error::BadRequest(
                    "if_condition must be a single expression".to_string(),
                ));
            }
        }
        let ceiling = self.config.max_view_rows;
        let max_rows = max_rows.unwrap_or(ceiling).min(ceiling).max(1);
        let reply = self
            .dispatch(
                session_id,
                Request::ViewData {
                    if_condition,
                    max_rows,
                },
            )
            .await?;
        match reply {
            Reply::Dataset(view) => Ok(view),
            _ => Err(Error::Internal("worker returned a mismatched reply".into())),
        }
    }

    /// Dataset shape without values.
    pub async fn introspect(&self, session_id: &str) -> Result<DatasetInfo> {
        match self.dispatch(session_id, Request::Introspect).await? {
            Reply::Introspect(info) => Ok(info),
            _ => Err(Error::Internal("worker returned a mismatched reply".into())),
        }
    }

    /// Execution state of a session.
    pub async fn execution_status(&self, session_id: &str) -> Result<ExecutionStatus> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        Ok(ExecutionStatus {
            state: entry.state,
            session_id: session_id.to_string(),
            elapsed_ms: entry
                .busy_since
                .map(|since| since.elapsed().as_millis() as u64)
                .unwrap_or(0),
        })
    }

    /// Engine availability, from the default session's worker.
    pub async fn engine_health(&self) -> Result<EngineHealth> {
        let session_id = self.default_session().await?;
        let worker = {
            let sessions = self.sessions.read().await;
            sessions
                .get(&session_id)
                .map(|entry| entry.worker.clone())
                .ok_or_else(|| Error::SessionNotFound(session_id.clone()))?
        };
        Ok(worker.health().await)
    }

    /// Live (non-dead) session count.
    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.state != SessionState::Dead)
            .count()
    }
}
