//! Per-session graph registry
//!
//! Tracks the image artifacts exported by the most recent successful run of
//! each session. The registry is replaced wholesale on every run (single-shot
//! semantics); consumers that want history persist it themselves.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;
use tokio::sync::RwLock;

use crate::protocol::GraphRef;

/// Start marker of the graph block written into the run log.
pub const GRAPHS_BLOCK_START: &str = "*** GRAPHS DETECTED";
/// End marker of the graph block written into the run log.
pub const GRAPHS_BLOCK_END: &str = "*** END GRAPHS";

static BLOCK_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\S.*?)\s*:\s*(\S.*?)\s*$").unwrap());

/// Registry of graph name -> exported file, per session
#[derive(Debug, Default)]
pub struct GraphRegistry {
    inner: RwLock<HashMap<String, Vec<GraphRef>>>,
}

impl GraphRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a session's entries with the set produced by its latest run
    pub async fn replace(&self, session_id: &str, graphs: Vec<GraphRef>) {
        self.inner.write().await.insert(session_id.to_string(), graphs);
    }

    /// All entries for a session, in export order
    pub async fn list(&self, session_id: &str) -> Vec<GraphRef> {
        self.inner
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Look up one graph by name
    pub async fn resolve(&self, session_id: &str, name: &str) -> Option<GraphRef> {
        self.inner
            .read()
            .await
            .get(session_id)?
            .iter()
            .find(|g| g.name == name)
            .cloned()
    }

    /// Drop all entries for a destroyed session
    pub async fn remove_session(&self, session_id: &str) {
        self.inner.write().await.remove(session_id);
    }
}

/// Parse the `GRAPHS DETECTED` block out of run-log text.
///
/// The block lists one `name : absolute_path` entry per line between the
/// start and end markers. Returns entries in block order.
pub fn parse_graphs_block(log_text: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    let mut in_block = false;
    for line in log_text.lines() {
        let trimmed = line.trim_end();
        if trimmed.starts_with(GRAPHS_BLOCK_END) {
            in_block = false;
            continue;
        }
        if trimmed.starts_with(GRAPHS_BLOCK_START) {
            in_block = true;
            continue;
        }
        if !in_block {
            continue;
        }
        if let Some(caps) = BLOCK_ENTRY.captures(trimmed) {
            entries.push((caps[1].to_string(), caps[2].to_string()));
        }
    }
    entries
}

/// Render the `GRAPHS DETECTED` block for the run log.
pub fn format_graphs_block(graphs: &[GraphRef]) -> String {
    let mut block = String::from(GRAPHS_BLOCK_START);
    block.push('\n');
    for graph in graphs {
        block.push_str(&format!("{} : {}\n", graph.name, graph.path));
    }
    block.push_str(GRAPHS_BLOCK_END);
    block.push('\n');
    block
}
