//! Server configuration
//!
//! Fixed configuration record for the bridge server. The binary populates it
//! from CLI flags; library consumers can build it directly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Stata edition, selects the console binary to launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineEdition {
    /// Stata/MP (multiprocessor)
    Mp,
    /// Stata/SE (standard)
    Se,
    /// Stata/BE (basic)
    Be,
}

impl EngineEdition {
    /// Console binary name for this edition
    pub fn binary_name(&self) -> &'static str {
        match self {
            EngineEdition::Mp => "stata-mp",
            EngineEdition::Se => "stata-se",
            EngineEdition::Be => "stata",
        }
    }

    /// Short edition tag as reported by `/health`
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineEdition::Mp => "mp",
            EngineEdition::Se => "se",
            EngineEdition::Be => "be",
        }
    }
}

/// Result post-filter mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Strip command echoes and cosmetic notes (default)
    Compact,
    /// Pass raw interpreter output through unchanged
    Full,
}

/// Where the result log of a `run_file` request is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFileLocation {
    /// Beside the executed do-file
    Dofile,
    /// In the do-file's parent directory
    Parent,
    /// Under the configured workspace root
    Workspace,
    /// Under the bridge state directory
    Extension,
    /// In `custom_log_directory`
    Custom,
}

/// Server configuration
///
/// Every knob the server accepts, as an explicitly enumerated record. See
/// the binary crate for the CLI flags that populate it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pin the exact port: a bind failure is fatal instead of probing onward
    #[serde(default)]
    pub force_port: bool,

    /// Explicit path to the Stata console binary. When unset the edition's
    /// default binary name is resolved via `PATH`.
    pub stata_path: Option<PathBuf>,

    /// Stata edition
    #[serde(default = "default_edition")]
    pub stata_edition: EngineEdition,

    /// Where `run_file` result logs are written
    #[serde(default = "default_log_location")]
    pub log_file_location: LogFileLocation,

    /// Directory used when `log_file_location` is `custom`
    pub custom_log_directory: Option<PathBuf>,

    /// Workspace root for `workspace`-relative log placement
    pub workspace_root: Option<PathBuf>,

    /// Result post-filter mode
    #[serde(default = "default_display_mode")]
    pub result_display_mode: DisplayMode,

    /// Token budget for inline results; 0 means unlimited. A token is
    /// counted as roughly 4 bytes.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,

    /// Enable named multi-session mode. When false a single implicit
    /// session is used and `session_id` parameters are ignored.
    #[serde(default)]
    pub multi_session: bool,

    /// Maximum number of live sessions (each holds an Engine license slot)
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Idle eviction threshold in seconds, measured from last dispatch
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Default per-request timeout in seconds when the request omits one
    #[serde(default = "default_run_timeout")]
    pub default_run_timeout: u64,

    /// Row ceiling for dataset snapshots served by the view endpoint
    #[serde(default = "default_max_view_rows")]
    pub max_view_rows: usize,

    /// Root for per-session state (logs, graphs, spill files). Defaults to
    /// `statabridge` under the system temp directory.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_edition() -> EngineEdition {
    EngineEdition::Mp
}

fn default_log_location() -> LogFileLocation {
    LogFileLocation::Extension
}

fn default_display_mode() -> DisplayMode {
    DisplayMode::Compact
}

fn default_max_output_tokens() -> usize {
    20_000
}

fn default_max_sessions() -> usize {
    8
}

fn default_session_timeout() -> u64 {
    1800
}

fn default_run_timeout() -> u64 {
    600
}

fn default_max_view_rows() -> usize {
    500
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("statabridge")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            force_port: false,
            stata_path: None,
            stata_edition: default_edition(),
            log_file_location: default_log_location(),
            custom_log_directory: None,
            workspace_root: None,
            result_display_mode: default_display_mode(),
            max_output_tokens: default_max_output_tokens(),
            multi_session: false,
            max_sessions: default_max_sessions(),
            session_timeout: default_session_timeout(),
            default_run_timeout: default_run_timeout(),
            max_view_rows: default_max_view_rows(),
            state_dir: default_state_dir(),
        }
    }
}

impl ServerConfig {
    /// Per-session log file path (the well-known path tailed by SSE streams)
    pub fn session_log_path(&self, session_id: &str) -> PathBuf {
        self.state_dir.join("logs").join(format!("{session_id}.log"))
    }

    /// Per-session graphs directory
    pub fn graphs_dir(&self, session_id: &str) -> PathBuf {
        self.state_dir.join("graphs").join(session_id)
    }

    /// Resolve the console binary to launch
    pub fn engine_binary(&self) -> PathBuf {
        self.stata_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.stata_edition.binary_name()))
    }

    /// Resolve where the result log of a `run_file` request goes.
    ///
    /// Returns `None` when the configured location cannot be resolved (no
    /// workspace root, no custom directory); the result log is skipped in
    /// that case rather than failing the run.
    pub fn result_log_dir(&self, dofile: &Path) -> Option<PathBuf> {
        match self.log_file_location {
            LogFileLocation::Dofile => dofile.parent().map(Path::to_path_buf),
            LogFileLocation::Parent => dofile
                .parent()
                .and_then(Path::parent)
                .map(Path::to_path_buf),
            LogFileLocation::Workspace => self.workspace_root.clone(),
            LogFileLocation::Extension => Some(self.state_dir.join("logs")),
            LogFileLocation::Custom => self.custom_log_directory.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.stata_edition, EngineEdition::Mp);
        assert_eq!(config.result_display_mode, DisplayMode::Compact);
        assert!(!config.multi_session);
        assert_eq!(config.max_sessions, 8);
    }

    #[test]
    fn test_edition_binary_names() {
        assert_eq!(EngineEdition::Mp.binary_name(), "stata-mp");
        assert_eq!(EngineEdition::Se.binary_name(), "stata-se");
        assert_eq!(EngineEdition::Be.binary_name(), "stata");
    }

    #[test]
    fn test_session_paths_are_scoped_by_id() {
        let config = ServerConfig::default();
        let log = config.session_log_path("abc");
        let graphs = config.graphs_dir("abc");
        assert!(log.ends_with("logs/abc.log"));
        assert!(graphs.ends_with("graphs/abc"));
    }

    #[test]
    fn test_result_log_dir_resolution() {
        let mut config = ServerConfig::default();
        let dofile = Path::new("/projects/study/analysis/model.do");

        config.log_file_location = LogFileLocation::Dofile;
        assert_eq!(
            config.result_log_dir(dofile),
            Some(PathBuf::from("/projects/study/analysis"))
        );

        config.log_file_location = LogFileLocation::Parent;
        assert_eq!(
            config.result_log_dir(dofile),
            Some(PathBuf::from("/projects/study"))
        );

        config.log_file_location = LogFileLocation::Workspace;
        assert_eq!(config.result_log_dir(dofile), None);
        config.workspace_root = Some(PathBuf::from("/projects"));
        assert_eq!(config.result_log_dir(dofile), Some(PathBuf::from("/projects")));

        config.log_file_location = LogFileLocation::Custom;
        config.custom_log_directory = None;
        assert_eq!(config.result_log_dir(dofile), None);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = ServerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.port, config.port);
        assert_eq!(back.stata_edition, config.stata_edition);
    }
}
