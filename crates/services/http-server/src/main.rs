//! Bridge server binary entry point
//!
//! Starts the Stata bridge: execution API, SSE streaming, and the MCP
//! adapter on one loopback listener.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:4000, Stata/MP from PATH)
//! statabridge-server
//!
//! # Point at an installation and enable multi-session mode
//! statabridge-server --stata-path /usr/local/stata/stata-mp \
//!     --multi-session --max-sessions 4
//! ```
//!
//! Exit codes: `0` clean shutdown, `2` port bind failure, `3` engine not
//! found or failed to initialize.

use clap::{Parser, ValueEnum};
use statabridge_core::worker::console::ConsoleFactory;
use statabridge_core::{
    DisplayMode, EngineEdition, LogFileLocation, ServerConfig, SessionManager,
};
use statabridge_http::HttpServer;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

/// Stata bridge server
#[derive(Parser)]
#[command(name = "statabridge-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Bind port
    #[arg(long, default_value_t = 4000)]
    port: u16,

    /// Fail instead of probing forward when the port is taken
    #[arg(long)]
    force_port: bool,

    /// Path to the Stata console binary
    #[arg(long, env = "STATABRIDGE_STATA_PATH")]
    stata_path: Option<PathBuf>,

    /// Stata edition
    #[arg(long, value_enum, default_value = "mp")]
    stata_edition: EditionArg,

    /// Write the server's own log to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Where result logs of run_file requests are placed
    #[arg(long, value_enum, default_value = "extension")]
    log_file_location: LogLocationArg,

    /// Directory used when --log-file-location=custom
    #[arg(long)]
    custom_log_directory: Option<PathBuf>,

    /// Workspace root for workspace-relative placement
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Result post-filter mode
    #[arg(long, value_enum, default_value = "compact")]
    result_display_mode: DisplayModeArg,

    /// Token budget for inline results; 0 means unlimited
    #[arg(long, default_value_t = 20_000)]
    max_output_tokens: usize,

    /// Server log verbosity (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "INFO")]
    log_level: LogLevelArg,

    /// Enable named multi-session mode
    #[arg(long)]
    multi_session: bool,

    /// Maximum number of live sessions
    #[arg(long, default_value_t = 8)]
    max_sessions: usize,

    /// Idle session eviction threshold in seconds
    #[arg(long, default_value_t = 1800)]
    session_timeout: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum EditionArg {
    Mp,
    Se,
    Be,
}

#[derive(Clone, Copy, ValueEnum)]
enum DisplayModeArg {
    Compact,
    Full,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLocationArg {
    Dofile,
    Parent,
    Workspace,
    Extension,
    Custom,
}

#[derive(Clone, Copy, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevelArg {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevelArg {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevelArg::Debug => "debug",
            LogLevelArg::Info => "info",
            LogLevelArg::Warn => "warn",
            LogLevelArg::Error => "error",
        }
    }
}

impl Cli {
    fn into_config(self) -> (ServerConfig, Option<PathBuf>, LogLevelArg) {
        let config = ServerConfig {
            host: self.host,
            port: self.port,
            force_port: self.force_port,
            stata_path: self.stata_path,
            stata_edition: match self.stata_edition {
                EditionArg::Mp => EngineEdition::Mp,
                EditionArg::Se => EngineEdition::Se,
                EditionArg::Be => EngineEdition::Be,
            },
            log_file_location: match self.log_file_location {
                LogLocationArg::Dofile => LogFileLocation::Dofile,
                LogLocationArg::Parent => LogFileLocation::Parent,
                LogLocationArg::Workspace => LogFileLocation::Workspace,
                LogLocationArg::Extension => LogFileLocation::Extension,
                LogLocationArg::Custom => LogFileLocation::Custom,
            },
            custom_log_directory: self.custom_log_directory,
            workspace_root: self.workspace_root,
            result_display_mode: match self.result_display_mode {
                DisplayModeArg::Compact => DisplayMode::Compact,
                DisplayModeArg::Full => DisplayMode::Full,
            },
            max_output_tokens: self.max_output_tokens,
            multi_session: self.multi_session,
            max_sessions: self.max_sessions,
            session_timeout: self.session_timeout,
            ..ServerConfig::default()
        };
        (config, self.log_file, self.log_level)
    }
}

/// Bootstrap failures with their process exit codes
enum BootstrapError {
    /// Could not bind a listener
    Port(String),
    /// Engine binary missing or unusable
    Engine(String),
}

impl BootstrapError {
    fn exit_code(&self) -> ExitCode {
        match self {
            BootstrapError::Port(_) => ExitCode::from(2),
            BootstrapError::Engine(_) => ExitCode::from(3),
        }
    }
}

fn init_tracing(level: LogLevelArg, log_file: Option<&PathBuf>) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_filter()));

    match log_file {
        Some(path) => {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(err) => {
                    tracing_subscriber::fmt().with_env_filter(filter).init();
                    error!(path = %path.display(), %err, "log file unusable, logging to stderr");
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Verify the engine binary can be found before accepting traffic.
fn preflight_engine(config: &ServerConfig) -> Result<PathBuf, BootstrapError> {
    let binary = config.engine_binary();
    if binary.is_absolute() || binary.components().count() > 1 {
        return if binary.is_file() {
            Ok(binary)
        } else {
            Err(BootstrapError::Engine(format!(
                "engine binary not found at {}",
                binary.display()
            )))
        };
    }

    // Bare name: resolve through PATH.
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(&binary);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(BootstrapError::Engine(format!(
        "engine binary {} not found on PATH; pass --stata-path",
        binary.display()
    )))
}

async fn run(config: ServerConfig) -> Result<(), BootstrapError> {
    let engine_binary = preflight_engine(&config)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = %engine_binary.display(),
        edition = config.stata_edition.as_str(),
        multi_session = config.multi_session,
        "bridge server starting"
    );

    let factory = Arc::new(ConsoleFactory::new(Arc::new(config.clone())));
    let manager = SessionManager::new(config, factory);
    let sweeper = manager.start_sweeper();

    let server = HttpServer::new(manager.clone());
    let listener = server
        .bind()
        .await
        .map_err(|err| BootstrapError::Port(err.to_string()))?;

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "shutdown signal handler failed");
        }
        info!("shutdown signal received");
    };

    let served = server.serve(listener, shutdown).await;

    // Drain sessions before exit so engine processes and license slots are
    // released.
    manager.shutdown().await;
    sweeper.abort();

    served.map_err(|err| BootstrapError::Port(err.to_string()))?;
    info!("bridge server shutdown complete");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, log_file, log_level) = cli.into_config();
    init_tracing(log_level, log_file.as_ref());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("statabridge-http")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                BootstrapError::Port(message) => error!(%message, "bootstrap failed: port"),
                BootstrapError::Engine(message) => error!(%message, "bootstrap failed: engine"),
            }
            err.exit_code()
        }
    }
}
