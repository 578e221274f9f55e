//! Shared server state

use std::collections::HashMap;
use std::sync::Arc;
use statabridge_core::SessionManager;
use tokio::sync::{mpsc, RwLock};

/// State cloned into every handler
#[derive(Clone)]
pub struct AppState {
    /// Session manager owning all workers
    pub manager: Arc<SessionManager>,
    /// Open legacy MCP SSE connections
    pub mcp_connections: Arc<McpConnections>,
}

impl AppState {
    /// Build the handler state over a session manager
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self {
            manager,
            mcp_connections: Arc::new(McpConnections::default()),
        }
    }
}

/// Registry of open legacy MCP SSE connections, keyed by connection id.
///
/// Each connection holds the sender half of the channel its SSE stream
/// drains; responses to posted messages are pushed through it.
#[derive(Default)]
pub struct McpConnections {
    inner: RwLock<HashMap<String, mpsc::Sender<String>>>,
}

impl McpConnections {
    /// Register a new connection and return its id plus the stream receiver.
    pub async fn register(&self) -> (String, mpsc::Receiver<String>) {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::channel(64);
        self.inner.write().await.insert(id.clone(), tx);
        tracing::debug!(connection_id = %id, "mcp sse connection registered");
        (id, rx)
    }

    /// Remove a closed connection.
    pub async fn remove(&self, id: &str) {
        self.inner.write().await.remove(id);
        tracing::debug!(connection_id = %id, "mcp sse connection removed");
    }

    /// Sender for a connection, if it is still open.
    pub async fn sender(&self, id: &str) -> Option<mpsc::Sender<String>> {
        self.inner.read().await.get(id).cloned()
    }
}
