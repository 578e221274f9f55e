//! The seam between the execution driver and a concrete Engine
//!
//! The driver owns all scheduling, logging, and capture logic; a backend
//! only knows how to move lines in and out of one interpreter instance and
//! how to signal it. Production uses the console child process in
//! [`crate::worker::console`]; tests and Stata-less development use the
//! scripted backend in [`crate::worker::scripted`].

use async_trait::async_trait;
use std::sync::Arc;

use crate::Result;

/// One live interpreter instance, line-oriented.
///
/// Implementations are owned exclusively by a session's driver task, which
/// serializes all access; they do not need internal locking.
#[async_trait]
pub trait EngineBackend: Send {
    /// Write one command line to the interpreter.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Next interpreter output line. `None` means the engine process ended.
    async fn next_line(&mut self) -> Result<Option<String>>;

    /// Handle that can signal this engine while the driver is blocked
    /// reading output. Cheap to call, callable from any task.
    fn interrupter(&self) -> Arc<dyn EngineInterrupt>;

    /// Graceful teardown: terminate, wait a bounded grace period, then
    /// force-kill.
    async fn shutdown(&mut self) -> Result<()>;

    /// Immediate force-kill.
    async fn kill(&mut self) -> Result<()>;
}

/// Cooperative-break signal for a running engine.
///
/// For the console backend this delivers SIGINT to the engine's process
/// group, which the Engine's break hook observes between commands.
pub trait EngineInterrupt: Send + Sync {
    /// Request a break. Best-effort; errors are swallowed by callers.
    fn interrupt(&self);
}

/// Spawns engine backends for new and restarted workers.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// Spawn a fresh engine rooted at `working_dir`.
    async fn spawn(&self, working_dir: &std::path::Path) -> Result<Box<dyn EngineBackend>>;
}
