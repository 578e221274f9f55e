//! Per-session execution driver
//!
//! The driver task is the single consumer of a worker's request queue. It
//! owns the engine backend, tees run output into the session log, captures
//! exported graphs, and enforces the wall-clock timeout with the
//! break -> grace -> kill escalation.

use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::backend::{BackendFactory, EngineBackend};
use super::console::{forward_slashes, normalize_dir};
use super::WorkerShared;
use crate::config::ServerConfig;
use crate::dataset::view_from_delimited;
use crate::graphs::format_graphs_block;
use crate::protocol::{
    DatasetInfo, DatasetView, GraphRef, Reply, Request, RunResult, RunStatus, VariableInfo,
    WorkerRequest,
};
use crate::{Error, Result};

/// Grace period between the break signal and the process kill.
const BREAK_GRACE: Duration = Duration::from_secs(2);

/// Deadline for the driver's own bookkeeping commands.
const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine output marking an observed break.
const BREAK_MARKER: &str = "--Break--";

pub(crate) async fn run_driver(
    session_id: String,
    config: Arc<ServerConfig>,
    factory: Arc<dyn BackendFactory>,
    working_dir: PathBuf,
    shared: Arc<WorkerShared>,
    mut requests: mpsc::Receiver<WorkerRequest>,
) {
    let mut driver = Driver {
        session_id,
        config,
        factory,
        backend: None,
        shared,
        current_dir: normalize_dir(&working_dir),
    };

    driver.initialize().await;
    let _ = driver.shared.ready.send(true);

    while let Some(WorkerRequest { request, reply }) = requests.recv().await {
        let result = driver.handle(request).await;
        let worker_died = matches!(&result, Err(Error::WorkerDead(_)))
            || matches!(&result, Ok(Reply::Run(run)) if run.worker_dead);
        // The requester may have gone away; the run already happened.
        let _ = reply.send(result);
        if worker_died {
            break;
        }
    }

    driver.teardown().await;
    tracing::debug!(session_id = %driver.session_id, "worker driver exited");
}

struct Driver {
    session_id: String,
    config: Arc<ServerConfig>,
    factory: Arc<dyn BackendFactory>,
    backend: Option<Box<dyn EngineBackend>>,
    shared: Arc<WorkerShared>,
    current_dir: PathBuf,
}

/// Outcome of one sentinel-delimited interpreter call
#[derive(Debug, Default)]
struct ExecOutcome {
    lines: Vec<String>,
    timed_out: bool,
    killed: bool,
    died: bool,
}

enum ExecEvent {
    Line(Option<String>),
    Deadline,
    Grace,
}

impl Driver {
    async fn initialize(&mut self) {
        // Invariant: the session log is truncated at creation, never mid-run.
        if let Some(parent) = self.log_path().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(self.log_path(), "");

        match self.factory.spawn(&self.current_dir).await {
            Ok(backend) => {
                *self.shared.interrupter.write().await = Some(backend.interrupter());
                self.backend = Some(backend);
                let version = self.probe_version().await;
                let mut health = self.shared.health.write().await;
                health.engine_available = true;
                health.version = version;
                tracing::info!(
                    session_id = %self.session_id,
                    version = %health.version,
                    "engine initialized"
                );
            }
            Err(err) => {
                tracing::error!(session_id = %self.session_id, %err, "engine failed to initialize");
                self.shared.health.write().await.engine_available = false;
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            if let Err(err) = backend.shutdown().await {
                tracing::warn!(session_id = %self.session_id, %err, "engine shutdown failed");
            }
        }
        self.shared.health.write().await.engine_available = false;
    }

    async fn handle(&mut self, request: Request) -> Result<Reply> {
        match request {
            Request::RunSelection {
                code,
                working_dir,
                timeout,
                ..
            } => {
                let lines: Vec<String> = code.lines().map(str::to_string).collect();
                self.run(lines, working_dir, timeout).await.map(Reply::Run)
            }
            Request::RunFile {
                path,
                working_dir,
                timeout,
            } => self.run_file(path, working_dir, timeout).await.map(Reply::Run),
            Request::Break => Ok(Reply::Ack),
            Request::Restart => self.restart().await.map(|()| Reply::Ack),
            Request::ViewData {
                if_condition,
                max_rows,
            } => self
                .view_data(if_condition, max_rows)
                .await
                .map(Reply::Dataset),
            Request::Introspect => self.introspect().await.map(Reply::Introspect),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.config.session_log_path(&self.session_id)
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn EngineBackend>> {
        self.backend
            .as_mut()
            .ok_or_else(|| Error::EngineUnavailable("engine is not initialized".to_string()))
    }

    /// One sentinel-delimited interpreter call.
    ///
    /// Sends `commands` followed by a `display` of a per-call nonce, then
    /// reads output until the nonce comes back. The optional deadline is
    /// wall-clock and independent of engine responsiveness: when it fires
    /// the engine gets a break signal, and `BREAK_GRACE` later a kill.
    async fn exec(
        &mut self,
        commands: &[String],
        deadline: Option<Instant>,
        mut log: Option<&mut LogFile>,
    ) -> Result<ExecOutcome> {
        let interrupter = self.shared.interrupter.read().await.clone();
        let session_id = self.session_id.clone();
        let backend = self.backend_mut()?;

        let nonce = format!("sb_eoc_{}", uuid::Uuid::new_v4().simple());
        for command in commands {
            backend
                .send_line(command)
                .await
                .map_err(|err| Error::WorkerDead(format!("engine input closed: {err}")))?;
        }
        backend
            .send_line(&format!("display \"{nonce}\""))
            .await
            .map_err(|err| Error::WorkerDead(format!("engine input closed: {err}")))?;

        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
        let deadline_at = deadline.unwrap_or(far_future);
        let mut grace_at = far_future;
        let mut outcome = ExecOutcome::default();

        loop {
            let event = {
                let next = backend.next_line();
                tokio::pin!(next);
                tokio::select! {
                    line = &mut next => ExecEvent::Line(line.unwrap_or(None)),
                    _ = tokio::time::sleep_until(deadline_at), if !outcome.timed_out => {
                        ExecEvent::Deadline
                    }
                    _ = tokio::time::sleep_until(grace_at), if outcome.timed_out => {
                        ExecEvent::Grace
                    }
                }
            };

            match event {
                ExecEvent::Line(Some(line)) => {
                    let line = line.trim_end_matches('\r');
                    if line.contains(&nonce) {
                        if line.trim() == nonce {
                            break;
                        }
                        // Echo of the sentinel command itself.
                        continue;
                    }
                    if let Some(log) = log.as_deref_mut() {
                        log.line(line);
                    }
                    outcome.lines.push(line.to_string());
                }
                ExecEvent::Line(None) => {
                    outcome.died = true;
                    break;
                }
                ExecEvent::Deadline => {
                    tracing::warn!(%session_id, "run deadline reached, breaking engine");
                    outcome.timed_out = true;
                    if let Some(interrupter) = &interrupter {
                        interrupter.interrupt();
                    }
                    grace_at = Instant::now() + BREAK_GRACE;
                }
                ExecEvent::Grace => {
                    tracing::warn!(%session_id, "break grace expired, killing engine");
                    outcome.killed = true;
                    outcome.died = true;
                    let _ = backend.kill().await;
                    break;
                }
            }
        }

        Ok(outcome)
    }

    /// Probe the interpreter version right after initialization.
    async fn probe_version(&mut self) -> String {
        let commands = vec!["display c(stata_version)".to_string()];
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        match self.exec(&commands, Some(deadline), None).await {
            Ok(outcome) => outcome
                .lines
                .iter()
                .rev()
                .map(|l| l.trim())
                .find(|l| !l.is_empty() && !l.starts_with(". "))
                .unwrap_or("")
                .to_string(),
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, %err, "version probe failed");
                String::new()
            }
        }
    }

    async fn run(
        &mut self,
        user_lines: Vec<String>,
        working_dir: Option<PathBuf>,
        timeout_secs: u64,
    ) -> Result<RunResult> {
        self.shared.break_flag.store(false, Ordering::SeqCst);

        self.change_dir(working_dir).await?;
        let baseline = self.graph_names().await?;

        let log_path = self.log_path();
        let mut log = LogFile::open_append(&log_path)?;
        log.line(&format!("*** Execution started: {}", Utc::now().to_rfc3339()));

        let deadline = Instant::now() + Duration::from_secs(timeout_secs.max(1));
        let outcome = self.exec(&user_lines, Some(deadline), Some(&mut log)).await?;

        let raw = outcome.lines.join("\n");
        let broke = self.shared.break_flag.swap(false, Ordering::SeqCst);

        if outcome.died && !outcome.timed_out {
            log.line(&format!(
                "*** Execution ended: {} (worker lost)",
                Utc::now().to_rfc3339()
            ));
            return Err(Error::WorkerDead(
                "engine process exited during the run".to_string(),
            ));
        }

        let status = if outcome.timed_out {
            RunStatus::Timeout
        } else if broke || raw.contains(BREAK_MARKER) {
            RunStatus::Cancelled
        } else if has_error_code(&outcome.lines) {
            RunStatus::Error
        } else {
            RunStatus::Success
        };

        let mut result = RunResult::new(status, raw, forward_slashes(&log_path));
        result.worker_dead = outcome.killed;

        // Only successful runs publish graphs (and only then does the
        // registry change).
        if status == RunStatus::Success {
            let graphs = self.capture_graphs(&baseline).await?;
            if !graphs.is_empty() {
                log.raw(&format_graphs_block(&graphs));
            }
            result.graphs = graphs;
        }

        log.line(&format!(
            "*** Execution ended: {} ({})",
            Utc::now().to_rfc3339(),
            status.as_str()
        ));
        Ok(result)
    }

    async fn run_file(
        &mut self,
        path: PathBuf,
        working_dir: Option<PathBuf>,
        timeout_secs: u64,
    ) -> Result<RunResult> {
        let command = format!("do \"{}\"", forward_slashes(&path));
        let result = self.run(vec![command], working_dir, timeout_secs).await?;

        // Drop a copy of the run log where the user configured it, named
        // after the do-file.
        if let Some(dir) = self.config.result_log_dir(&path) {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "dofile".to_string());
            let target = dir.join(format!("{stem}.log"));
            if let Err(err) = std::fs::create_dir_all(&dir)
                .and_then(|()| std::fs::write(&target, &result.output))
            {
                tracing::warn!(
                    session_id = %self.session_id,
                    target = %target.display(),
                    %err,
                    "result log copy failed"
                );
            }
        }

        Ok(result)
    }

    async fn change_dir(&mut self, working_dir: Option<PathBuf>) -> Result<()> {
        let Some(dir) = working_dir else {
            return Ok(());
        };
        let dir = normalize_dir(&dir);
        if dir == self.current_dir {
            return Ok(());
        }
        let command = format!("quietly cd \"{}\"", forward_slashes(&dir));
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        let outcome = self.exec(&[command], Some(deadline), None).await?;
        if outcome.died {
            return Err(Error::WorkerDead("engine lost while changing directory".into()));
        }
        if has_error_code(&outcome.lines) {
            return Err(Error::BadRequest(format!(
                "cannot change working directory to {}",
                dir.display()
            )));
        }
        self.current_dir = dir;
        Ok(())
    }

    /// Names currently known to the engine's graph list.
    async fn graph_names(&mut self) -> Result<Vec<String>> {
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        let outcome = self
            .exec(&["graph dir".to_string()], Some(deadline), None)
            .await?;
        if outcome.died {
            return Err(Error::WorkerDead("engine lost while listing graphs".into()));
        }
        Ok(outcome
            .lines
            .iter()
            .filter(|line| !line.starts_with(". ") && !is_error_line(line))
            .flat_map(|line| line.split_whitespace())
            .map(str::to_string)
            .collect())
    }

    /// Export every graph created since `baseline` and reference it.
    async fn capture_graphs(&mut self, baseline: &[String]) -> Result<Vec<GraphRef>> {
        let after = self.graph_names().await?;
        let new_names: Vec<String> = after
            .into_iter()
            .filter(|name| !baseline.contains(name))
            .collect();
        if new_names.is_empty() {
            return Ok(Vec::new());
        }

        let graphs_dir = self.config.graphs_dir(&self.session_id);
        std::fs::create_dir_all(&graphs_dir)?;

        let mut refs = Vec::new();
        for (sequence, name) in new_names.into_iter().enumerate() {
            let path = forward_slashes(&graphs_dir.join(format!("{name}.png")));
            let command = format!("quietly graph export \"{path}\", name(\"{name}\") replace");
            let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
            let outcome = self.exec(&[command], Some(deadline), None).await?;
            if outcome.died {
                return Err(Error::WorkerDead("engine lost while exporting graphs".into()));
            }
            if has_error_code(&outcome.lines) {
                tracing::warn!(session_id = %self.session_id, name, "graph export failed");
                continue;
            }
            refs.push(GraphRef {
                name,
                path,
                created_at: Utc::now(),
                sequence,
            });
        }
        Ok(refs)
    }

    async fn restart(&mut self) -> Result<()> {
        tracing::info!(session_id = %self.session_id, "restarting engine");
        if let Some(mut backend) = self.backend.take() {
            let _ = backend.shutdown().await;
        }
        *self.shared.interrupter.write().await = None;
        self.shared.health.write().await.engine_available = false;

        // Invariant: the log is truncated on restart, never mid-run.
        let _ = std::fs::write(self.log_path(), "");
        if let Ok(mut log) = LogFile::open_append(&self.log_path()) {
            log.line(&format!("*** Session restarted: {}", Utc::now().to_rfc3339()));
        }

        let backend = self.factory.spawn(&self.current_dir).await.map_err(|err| {
            tracing::error!(session_id = %self.session_id, %err, "engine re-initialization failed");
            Error::EngineUnavailable(format!("restart failed: {err}"))
        })?;
        *self.shared.interrupter.write().await = Some(backend.interrupter());
        self.backend = Some(backend);

        let version = self.probe_version().await;
        let mut health = self.shared.health.write().await;
        health.engine_available = true;
        health.version = version;
        Ok(())
    }

    async fn view_data(
        &mut self,
        if_condition: Option<String>,
        max_rows: usize,
    ) -> Result<DatasetView> {
        let condition = if_condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let total_rows = self.matching_count(condition).await?;

        let tmp_dir = self.config.state_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir)?;
        let export_path =
            tmp_dir.join(format!("view_{}.csv", uuid::Uuid::new_v4().simple()));
        let export_target = forward_slashes(&export_path);

        let command = match condition {
            Some(cond) => format!(
                "quietly export delimited using \"{export_target}\" if {cond}, replace"
            ),
            None => format!("quietly export delimited using \"{export_target}\", replace"),
        };
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        let outcome = self.exec(&[command], Some(deadline), None).await?;
        if outcome.died {
            return Err(Error::WorkerDead("engine lost while exporting data".into()));
        }
        if let Some(error_line) = outcome.lines.iter().find(|l| is_error_line(l)) {
            let _ = std::fs::remove_file(&export_path);
            return Err(Error::BadRequest(format!(
                "dataset export rejected: {error_line}"
            )));
        }

        let text = std::fs::read_to_string(&export_path).unwrap_or_default();
        let _ = std::fs::remove_file(&export_path);
        view_from_delimited(&text, total_rows, max_rows)
    }

    /// Observation count matching the predicate (or all observations).
    async fn matching_count(&mut self, condition: Option<&str>) -> Result<usize> {
        let count = match condition {
            Some(cond) => format!("quietly count if {cond}"),
            None => "quietly count".to_string(),
        };
        let commands = vec![count, "display r(N)".to_string()];
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        let outcome = self.exec(&commands, Some(deadline), None).await?;
        if outcome.died {
            return Err(Error::WorkerDead("engine lost while counting".into()));
        }
        if let Some(error_line) = outcome.lines.iter().find(|l| is_error_line(l)) {
            return Err(Error::BadRequest(format!(
                "predicate rejected: {error_line}"
            )));
        }
        Ok(last_scalar(&outcome.lines).unwrap_or(0))
    }

    async fn introspect(&mut self) -> Result<DatasetInfo> {
        let commands = vec![
            "quietly describe".to_string(),
            "display r(N)".to_string(),
        ];
        let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
        let outcome = self.exec(&commands, Some(deadline), None).await?;
        if outcome.died {
            return Err(Error::WorkerDead("engine lost while describing data".into()));
        }
        let obs_count = last_scalar(&outcome.lines).unwrap_or(0) as u64;

        let outcome = self
            .exec(&["display r(k)".to_string()], Some(deadline), None)
            .await?;
        let var_count = last_scalar(&outcome.lines).unwrap_or(0) as u64;

        let mut variables = Vec::new();
        if var_count > 0 {
            let block = vec![
                "foreach v of varlist _all {".to_string(),
                "display \"`v'|`:type `v''|`:format `v''|`:variable label `v''\"".to_string(),
                "}".to_string(),
            ];
            let deadline = Instant::now() + HOUSEKEEPING_TIMEOUT;
            let outcome = self.exec(&block, Some(deadline), None).await?;
            if outcome.died {
                return Err(Error::WorkerDead("engine lost while describing data".into()));
            }
            for line in &outcome.lines {
                if line.starts_with(". ") || is_numbered_echo(line) {
                    continue;
                }
                let mut parts = line.splitn(4, '|');
                let (Some(name), Some(var_type), Some(format)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    continue;
                };
                variables.push(VariableInfo {
                    name: name.trim().to_string(),
                    var_type: var_type.trim().to_string(),
                    format: format.trim().to_string(),
                    label: parts.next().unwrap_or("").trim().to_string(),
                });
            }
        }

        Ok(DatasetInfo {
            obs_count,
            var_count,
            variables,
        })
    }
}

/// Append-mode handle on the session log; dropped (closed) per command.
struct LogFile {
    file: std::fs::File,
}

impl LogFile {
    fn open_append(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self { file })
    }

    fn line(&mut self, text: &str) {
        let _ = writeln!(self.file, "{text}");
    }

    fn raw(&mut self, text: &str) {
        let _ = self.file.write_all(text.as_bytes());
    }
}

/// Whether one output line is an interpreter error code (`r(###);`).
fn is_error_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed
        .strip_prefix("r(")
        .and_then(|rest| rest.strip_suffix(");"))
        .is_some_and(|code| !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()))
}

fn has_error_code(lines: &[String]) -> bool {
    lines.iter().any(|line| is_error_line(line))
}

/// Numbered block-entry echo, e.g. `  2. display ...`.
fn is_numbered_echo(line: &str) -> bool {
    let trimmed = line.trim_start();
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    digits > 0 && trimmed[digits..].starts_with('.')
}

/// Last line that parses as an unsigned scalar, skipping echoes.
fn last_scalar(lines: &[String]) -> Option<usize> {
    lines
        .iter()
        .rev()
        .filter(|line| !line.starts_with(". ") && !is_numbered_echo(line))
        .find_map(|line| line.trim().parse::<usize>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_line_detection() {
        assert!(is_error_line("r(111);"));
        assert!(is_error_line("  r(199);  "));
        assert!(!is_error_line("r();"));
        assert!(!is_error_line("r(abc);"));
        assert!(!is_error_line("error r(111); inline"));
    }

    #[test]
    fn test_numbered_echo_detection() {
        assert!(is_numbered_echo("  2. display `x'"));
        assert!(is_numbered_echo("10."));
        assert!(!is_numbered_echo("price|float|%9.0g|Price"));
        assert!(!is_numbered_echo(". display 1"));
    }

    #[test]
    fn test_last_scalar_skips_echoes() {
        let lines = vec![
            ". quietly count".to_string(),
            ". display r(N)".to_string(),
            "74".to_string(),
        ];
        assert_eq!(last_scalar(&lines), Some(74));
        assert_eq!(last_scalar(&[". display r(N)".to_string()]), None);
    }
}
