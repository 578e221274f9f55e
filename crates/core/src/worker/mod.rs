//! Engine workers
//!
//! One worker per session: a dedicated driver task owning a single Engine
//! instance behind the [`backend::EngineBackend`] seam. All interpreter
//! access is serialized through the worker's request channel; cancellation
//! and timeout escalation are signalled out-of-band.

pub mod backend;
pub mod console;
mod driver;
pub mod scripted;

pub use backend::{BackendFactory, EngineBackend, EngineInterrupt};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};

use crate::config::ServerConfig;
use crate::protocol::{EngineHealth, Reply, Request, WorkerRequest};
use crate::{Error, Result};

/// State shared between a worker's handle and its driver task
pub(crate) struct WorkerShared {
    /// Set when a client requested a break for the in-flight run
    pub break_flag: AtomicBool,
    /// Signal handle for the current engine instance
    pub interrupter: RwLock<Option<Arc<dyn EngineInterrupt>>>,
    /// Engine availability as of the last (re)initialization
    pub health: RwLock<EngineHealth>,
    /// Flips to true once initial engine bring-up has settled
    pub ready: watch::Sender<bool>,
}

/// Handle to a session's worker
///
/// Cloneable; all clones feed the same single-consumer request queue.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
    shared: Arc<WorkerShared>,
    ready_rx: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Spawn a worker for `session_id` and return its handle.
    ///
    /// The driver task initializes the engine asynchronously; health
    /// reflects the outcome once initialization finishes.
    pub fn spawn(
        session_id: String,
        config: Arc<ServerConfig>,
        factory: Arc<dyn BackendFactory>,
        working_dir: PathBuf,
    ) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let shared = Arc::new(WorkerShared {
            break_flag: AtomicBool::new(false),
            interrupter: RwLock::new(None),
            health: RwLock::new(EngineHealth {
                engine_available: false,
                version: String::new(),
                edition: config.stata_edition.as_str().to_string(),
            }),
            ready: ready_tx,
        });

        // Capacity 1: the session invariant already forbids concurrent
        // submits; the queue only ever holds the in-flight request.
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(driver::run_driver(
            session_id,
            config,
            factory,
            working_dir,
            shared.clone(),
            rx,
        ));

        Self {
            tx,
            shared,
            ready_rx,
        }
    }

    /// Submit a request and wait for its reply.
    pub async fn submit(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(WorkerRequest {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::WorkerDead("worker request channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::WorkerDead("worker dropped the request".to_string()))?
    }

    /// Request a cooperative break of the in-flight run. Non-blocking;
    /// returns immediately after signalling the engine.
    pub async fn request_break(&self) {
        self.shared.break_flag.store(true, Ordering::SeqCst);
        if let Some(interrupter) = self.shared.interrupter.read().await.as_ref() {
            interrupter.interrupt();
        }
    }

    /// Engine availability for this worker.
    ///
    /// Waits for the initial engine bring-up to settle, so callers right
    /// after session creation see the real outcome instead of the default.
    pub async fn health(&self) -> EngineHealth {
        let mut ready = self.ready_rx.clone();
        while !*ready.borrow() {
            if ready.changed().await.is_err() {
                break;
            }
        }
        self.shared.health.read().await.clone()
    }

    /// Whether the driver task has exited (worker dead)
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
