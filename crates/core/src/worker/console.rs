//! Console child process hosting one Engine instance
//!
//! Spawns the Stata console binary in its own process group with piped
//! stdio. Crashes stay contained in the child; the break protocol is a
//! SIGINT to the group, observed by the Engine between commands.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::backend::{BackendFactory, EngineBackend, EngineInterrupt};
use crate::config::ServerConfig;
use crate::{Error, Result};

/// How long a terminated engine gets to exit before it is force-killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// A Stata console child process
pub struct ConsoleEngine {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    interrupter: Arc<ConsoleInterrupt>,
}

/// Signal handle targeting the engine's process group
struct ConsoleInterrupt {
    pid: i32,
}

impl EngineInterrupt for ConsoleInterrupt {
    fn interrupt(&self) {
        signal_group(self.pid, InterruptKind::Break);
    }
}

enum InterruptKind {
    Break,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: i32, kind: InterruptKind) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match kind {
        InterruptKind::Break => Signal::SIGINT,
        InterruptKind::Terminate => Signal::SIGTERM,
        InterruptKind::Kill => Signal::SIGKILL,
    };
    if let Err(err) = killpg(Pid::from_raw(pid), signal) {
        tracing::debug!(pid, %err, "engine signal not delivered");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: i32, _kind: InterruptKind) {
    // No process-group signalling; teardown falls back to Child::kill.
}

impl ConsoleEngine {
    /// Spawn the console binary rooted at `working_dir`.
    pub async fn spawn(config: &ServerConfig, working_dir: &Path) -> Result<Self> {
        let binary = config.engine_binary();
        let mut std_command = std::process::Command::new(&binary);
        std_command
            .arg("-q")
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so break/kill signals never reach the server.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            std_command.process_group(0);
        }

        let mut command = Command::from(std_command);
        command.kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| {
            Error::EngineUnavailable(format!(
                "failed to launch {} ({err})",
                binary.display()
            ))
        })?;

        let pid = child.id().ok_or_else(|| {
            Error::EngineUnavailable("engine exited before initialization".to_string())
        })? as i32;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("engine stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("engine stdout not captured".to_string()))?;

        // Engine diagnostics go to the server log, never to clients.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(engine_pid = pid, "{line}");
                }
            });
        }

        tracing::info!(engine_pid = pid, binary = %binary.display(), "engine process spawned");

        Ok(Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            interrupter: Arc::new(ConsoleInterrupt { pid }),
        })
    }

    async fn wait_with_grace(&mut self) -> bool {
        tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait())
            .await
            .is_ok()
    }
}

#[async_trait]
impl EngineBackend for ConsoleEngine {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.lines.next_line().await?)
    }

    fn interrupter(&self) -> Arc<dyn EngineInterrupt> {
        self.interrupter.clone()
    }

    async fn shutdown(&mut self) -> Result<()> {
        signal_group(self.interrupter.pid, InterruptKind::Terminate);
        if !self.wait_with_grace().await {
            tracing::warn!(
                engine_pid = self.interrupter.pid,
                "engine ignored terminate, killing"
            );
            self.kill().await?;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        signal_group(self.interrupter.pid, InterruptKind::Kill);
        // Reap whichever signal path won.
        let _ = self.child.kill().await;
        Ok(())
    }
}

/// Factory spawning console engines from the server configuration
pub struct ConsoleFactory {
    config: Arc<ServerConfig>,
}

impl ConsoleFactory {
    /// Create a factory over the given configuration
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BackendFactory for ConsoleFactory {
    async fn spawn(&self, working_dir: &Path) -> Result<Box<dyn EngineBackend>> {
        std::fs::create_dir_all(working_dir)?;
        let engine = ConsoleEngine::spawn(&self.config, working_dir).await?;
        Ok(Box::new(engine))
    }
}

/// Render a path with forward slashes regardless of host OS.
pub fn forward_slashes(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// Strip trailing separators from a directory path (root excepted).
pub fn normalize_dir(dir: &Path) -> PathBuf {
    let text = dir.display().to_string();
    let trimmed = text.trim_end_matches(['/', '\\']);
    if trimmed.is_empty() {
        dir.to_path_buf()
    } else {
        PathBuf::from(trimmed)
    }
}
