//! Scripted engine backend
//!
//! A small interpreter emulation used by the scheduler tests and for
//! running the bridge without a Stata installation. It speaks just enough
//! of the console protocol for the driver: command echoes, `display`,
//! `sleep`, graph bookkeeping, dataset export, and error codes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use super::backend::{BackendFactory, EngineBackend, EngineInterrupt};
use crate::{Error, Result};

/// Dataset the scripted engine pretends to hold in memory
#[derive(Debug, Clone, Default)]
pub struct ScriptedDataset {
    /// Delimited export text (header + rows)
    pub csv: String,
    /// Unfiltered observation count
    pub total_rows: usize,
    /// `name|type|format|label` metadata lines
    pub variables: Vec<String>,
}

impl ScriptedDataset {
    /// Export text with a simple `var <op> number` predicate applied.
    /// `None` when the predicate cannot be evaluated against this dataset.
    fn filtered_csv(&self, condition: Option<&str>) -> Option<String> {
        let Some(condition) = condition else {
            return Some(self.csv.clone());
        };
        let (column, op, value) = self.comparison(condition)?;
        let mut lines = self.csv.lines();
        let mut out = String::from(lines.next()?);
        out.push('\n');
        for line in lines.filter(|l| !l.trim().is_empty()) {
            if row_matches(line, column, op, value) {
                out.push_str(line);
                out.push('\n');
            }
        }
        Some(out)
    }

    /// Rows satisfying the predicate. `None` when it cannot be evaluated.
    fn matching(&self, condition: &str) -> Option<usize> {
        let (column, op, value) = self.comparison(condition)?;
        let mut lines = self.csv.lines();
        lines.next()?;
        Some(
            lines
                .filter(|l| !l.trim().is_empty())
                .filter(|l| row_matches(l, column, op, value))
                .count(),
        )
    }

    /// Resolve a predicate to (column index, operator, literal).
    fn comparison(&self, condition: &str) -> Option<(usize, Cmp, f64)> {
        let (variable, op, value) = parse_comparison(condition)?;
        let header = self.csv.lines().next()?;
        let column = header
            .split(',')
            .position(|c| c.trim().trim_matches('"') == variable)?;
        Some((column, op, value))
    }
}

/// Comparison operators understood by the scripted predicate evaluator
#[derive(Debug, Clone, Copy)]
enum Cmp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl Cmp {
    fn eval(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Cmp::Gt => lhs > rhs,
            Cmp::Lt => lhs < rhs,
            Cmp::Ge => lhs >= rhs,
            Cmp::Le => lhs <= rhs,
            Cmp::Eq => lhs == rhs,
            Cmp::Ne => lhs != rhs,
        }
    }
}

/// Parse `var <op> number`; two-character operators are tried first.
fn parse_comparison(condition: &str) -> Option<(String, Cmp, f64)> {
    const OPS: [(&str, Cmp); 6] = [
        (">=", Cmp::Ge),
        ("<=", Cmp::Le),
        ("==", Cmp::Eq),
        ("!=", Cmp::Ne),
        (">", Cmp::Gt),
        ("<", Cmp::Lt),
    ];
    for (token, op) in OPS {
        if let Some((lhs, rhs)) = condition.split_once(token) {
            let variable = lhs.trim();
            let value: f64 = rhs.trim().parse().ok()?;
            if variable.is_empty() {
                return None;
            }
            return Some((variable.to_string(), op, value));
        }
    }
    None
}

fn row_matches(line: &str, column: usize, op: Cmp, value: f64) -> bool {
    line.split(',')
        .nth(column)
        .and_then(|cell| cell.trim().trim_matches('"').parse::<f64>().ok())
        .is_some_and(|cell| op.eval(cell, value))
}

/// The `if` clause of an `export delimited using "..." if <cond>, replace`
/// command, when present.
fn export_condition(body: &str) -> Option<String> {
    let open = body.find('"')?;
    let close = open + 1 + body[open + 1..].find('"')?;
    let rest = body[close + 1..].trim_start();
    let rest = rest.strip_prefix("if ")?;
    let condition = rest.split_once(',').map(|(c, _)| c).unwrap_or(rest).trim();
    Some(condition.to_string())
}

/// Configuration for the scripted engine
#[derive(Debug, Clone)]
pub struct ScriptedConfig {
    /// Version string reported for `c(stata_version)`
    pub version: String,
    /// Dataset served by export/describe commands
    pub dataset: ScriptedDataset,
}

impl Default for ScriptedConfig {
    fn default() -> Self {
        Self {
            version: "18.5".to_string(),
            dataset: ScriptedDataset::default(),
        }
    }
}

/// Scripted engine instance
pub struct ScriptedEngine {
    cmd_tx: Option<mpsc::UnboundedSender<String>>,
    out_rx: mpsc::UnboundedReceiver<String>,
    interrupter: Arc<ScriptedInterrupt>,
}

/// Break handle shared with the emulation task
pub struct ScriptedInterrupt {
    flag: AtomicBool,
    notify: Notify,
}

impl EngineInterrupt for ScriptedInterrupt {
    fn interrupt(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

impl ScriptedEngine {
    /// Spawn a scripted engine with the given behavior
    pub fn spawn(config: ScriptedConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let interrupter = Arc::new(ScriptedInterrupt {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let task = Interpreter {
            config,
            out: out_tx,
            breaker: interrupter.clone(),
            graphs: Vec::new(),
            block: VecDeque::new(),
            block_depth: 0,
            last_scalar: String::new(),
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx: Some(cmd_tx),
            out_rx,
            interrupter,
        }
    }
}

#[async_trait]
impl EngineBackend for ScriptedEngine {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        let tx = self
            .cmd_tx
            .as_ref()
            .ok_or_else(|| Error::WorkerDead("scripted engine killed".to_string()))?;
        tx.send(line.to_string())
            .map_err(|_| Error::WorkerDead("scripted engine exited".to_string()))
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        Ok(self.out_rx.recv().await)
    }

    fn interrupter(&self) -> Arc<dyn EngineInterrupt> {
        self.interrupter.clone()
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.cmd_tx = None;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        self.cmd_tx = None;
        self.out_rx.close();
        Ok(())
    }
}

/// The emulation task: consumes command lines, produces output lines.
struct Interpreter {
    config: ScriptedConfig,
    out: mpsc::UnboundedSender<String>,
    breaker: Arc<ScriptedInterrupt>,
    graphs: Vec<String>,
    block: VecDeque<String>,
    block_depth: i32,
    last_scalar: String,
}

impl Interpreter {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = commands.recv().await {
            self.emit(format!(". {line}"));
            if self.block_depth > 0 {
                self.block_depth += brace_delta(&line);
                self.block.push_back(line);
                if self.block_depth <= 0 {
                    self.run_block().await;
                }
                continue;
            }
            let delta = brace_delta(&line);
            if delta > 0 {
                self.block_depth = delta;
                self.block.clear();
                self.block.push_back(line);
                continue;
            }
            if !self.execute(&line).await {
                break;
            }
        }
    }

    fn emit(&self, line: impl Into<String>) {
        let _ = self.out.send(line.into());
    }

    /// Execute one command; returns false when the engine "dies".
    async fn execute(&mut self, line: &str) -> bool {
        let command = line.trim();
        let quiet = command.starts_with("quietly ");
        let body = command.strip_prefix("quietly ").unwrap_or(command).trim();

        match () {
            _ if body.starts_with("display ") => {
                let arg = body["display ".len()..].trim();
                if !quiet {
                    self.emit(self.display_value(arg));
                }
            }
            _ if body.starts_with("sleep ") => {
                let millis: u64 = body["sleep ".len()..].trim().parse().unwrap_or(0);
                self.interruptible_sleep(millis).await;
            }
            _ if body == "hang" => {
                // Pathological run that ignores the break protocol.
                loop {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                }
            }
            _ if body.starts_with("makegraph ") => {
                let name = body["makegraph ".len()..].trim().to_string();
                if !self.graphs.contains(&name) {
                    self.graphs.push(name);
                }
            }
            _ if body == "graph dir" => {
                for name in &self.graphs {
                    self.emit(name.clone());
                }
            }
            _ if body.starts_with("graph export ") => {
                if let Some(path) = first_quoted(body) {
                    // A tiny stand-in PNG so the artifact really exists.
                    let _ = std::fs::create_dir_all(
                        Path::new(&path).parent().unwrap_or(Path::new(".")),
                    );
                    let _ = std::fs::write(&path, b"\x89PNG\r\n\x1a\nscripted");
                }
            }
            _ if body.starts_with("do ") => {
                match first_quoted(body).map(|path| std::fs::read_to_string(&path)) {
                    Some(Ok(text)) => {
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            if !Box::pin(self.execute(line)).await {
                                return false;
                            }
                        }
                    }
                    _ => {
                        self.emit("file not found");
                        self.emit("r(601);");
                    }
                }
            }
            _ if body.starts_with("export delimited ") => {
                if let Some(path) = first_quoted(body) {
                    let condition = export_condition(body);
                    match self.config.dataset.filtered_csv(condition.as_deref()) {
                        Some(csv) => {
                            let _ = std::fs::write(&path, csv);
                        }
                        None => self.emit("r(111);"),
                    }
                }
            }
            _ if body.starts_with("count") => {
                let condition = body
                    .strip_prefix("count")
                    .map(str::trim)
                    .filter(|rest| !rest.is_empty())
                    .and_then(|rest| rest.strip_prefix("if "));
                match condition {
                    None => {
                        self.last_scalar = self.config.dataset.total_rows.to_string();
                    }
                    Some(cond) => match self.config.dataset.matching(cond.trim()) {
                        Some(rows) => self.last_scalar = rows.to_string(),
                        None => {
                            self.emit("r(111);");
                            return true;
                        }
                    },
                }
                if !quiet {
                    self.emit(self.last_scalar.clone());
                }
            }
            _ if body.starts_with("describe") => {
                self.last_scalar = self.config.dataset.total_rows.to_string();
            }
            _ if body.starts_with("error ") => {
                let code = body["error ".len()..].trim().to_string();
                self.emit(format!("r({code});"));
            }
            _ if body.starts_with("cd") || body.starts_with("log ") || body == "set more off" => {}
            _ if body == "crash" => {
                // Simulate an engine death mid-command: stop consuming
                // input and drop the output channel.
                return false;
            }
            _ => {
                if !quiet {
                    self.emit(format!("command {body} is unrecognized"));
                    self.emit("r(199);".to_string());
                }
            }
        }
        true
    }

    /// Expand `display` arguments the driver relies on.
    fn display_value(&self, arg: &str) -> String {
        if let Some(text) = arg.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            return text.to_string();
        }
        match arg {
            "c(stata_version)" => self.config.version.clone(),
            "r(N)" => self.last_scalar.clone(),
            "r(k)" => self.config.dataset.variables.len().to_string(),
            "_N" => self.config.dataset.total_rows.to_string(),
            other => other.to_string(),
        }
    }

    async fn run_block(&mut self) {
        let opener = self.block.pop_front().unwrap_or_default();
        self.block_depth = 0;
        if opener.trim_start().starts_with("foreach v of varlist") {
            for line in self.config.dataset.variables.clone() {
                self.emit(line);
            }
            return;
        }
        // Other blocks: execute body lines in order, once.
        let body: Vec<String> = self.block.drain(..).collect();
        for line in body {
            let trimmed = line.trim();
            if trimmed != "}" {
                let _ = Box::pin(self.execute(trimmed)).await;
            }
        }
    }

    async fn interruptible_sleep(&self, millis: u64) {
        if self.breaker.flag.swap(false, Ordering::SeqCst) {
            self.emit("--Break--");
            self.emit("r(1);");
            return;
        }
        let sleep = tokio::time::sleep(std::time::Duration::from_millis(millis));
        tokio::select! {
            _ = sleep => {}
            _ = self.breaker.notify.notified() => {
                self.breaker.flag.store(false, Ordering::SeqCst);
                self.emit("--Break--");
                self.emit("r(1);");
            }
        }
    }
}

fn brace_delta(text: &str) -> i32 {
    text.chars().fold(0, |acc, ch| match ch {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

/// First double-quoted token in a command line.
fn first_quoted(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let end = start + text[start..].find('"')?;
    Some(text[start..end].to_string())
}

/// Factory for scripted engines
pub struct ScriptedFactory {
    config: ScriptedConfig,
}

impl ScriptedFactory {
    /// Factory producing engines with the given behavior
    pub fn new(config: ScriptedConfig) -> Self {
        Self { config }
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new(ScriptedConfig::default())
    }
}

#[async_trait]
impl BackendFactory for ScriptedFactory {
    async fn spawn(&self, working_dir: &Path) -> Result<Box<dyn EngineBackend>> {
        std::fs::create_dir_all(working_dir)?;
        Ok(Box::new(ScriptedEngine::spawn(self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_display_echo_and_value() {
        let mut engine = ScriptedEngine::spawn(ScriptedConfig::default());
        engine.send_line("display \"hello\"").await.unwrap();
        assert_eq!(engine.next_line().await.unwrap().unwrap(), ". display \"hello\"");
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_unknown_command_reports_error_code() {
        let mut engine = ScriptedEngine::spawn(ScriptedConfig::default());
        engine.send_line("frobnicate").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(
            engine.next_line().await.unwrap().unwrap(),
            "command frobnicate is unrecognized"
        );
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "r(199);");
    }

    #[tokio::test]
    async fn test_sleep_is_interruptible() {
        let mut engine = ScriptedEngine::spawn(ScriptedConfig::default());
        let interrupter = engine.interrupter();
        engine.send_line("sleep 60000").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        interrupter.interrupt();
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "--Break--");
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "r(1);");
    }

    fn auto_dataset() -> ScriptedDataset {
        ScriptedDataset {
            csv: "price,mpg\n4099,22\n4749,17\n".to_string(),
            total_rows: 2,
            variables: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_count_honors_if_clause() {
        let mut engine = ScriptedEngine::spawn(ScriptedConfig {
            dataset: auto_dataset(),
            ..ScriptedConfig::default()
        });

        engine.send_line("count").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "2");

        engine.send_line("count if mpg < 20").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "1");

        // Predicates over unknown variables fail the engine way.
        engine.send_line("count if horsepower > 100").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "r(111);");
    }

    #[tokio::test]
    async fn test_export_honors_if_clause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slice.csv");
        let mut engine = ScriptedEngine::spawn(ScriptedConfig {
            dataset: auto_dataset(),
            ..ScriptedConfig::default()
        });

        let command = format!(
            "export delimited using \"{}\" if price > 4500, replace",
            path.display()
        );
        engine.send_line(&command).await.unwrap();
        engine.next_line().await.unwrap(); // echo
        engine.send_line("display \"sync\"").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "sync");

        let exported = std::fs::read_to_string(&path).unwrap();
        assert_eq!(exported, "price,mpg\n4749,17\n");
    }

    #[tokio::test]
    async fn test_graph_bookkeeping() {
        let mut engine = ScriptedEngine::spawn(ScriptedConfig::default());
        engine.send_line("makegraph g1").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        engine.send_line("graph dir").await.unwrap();
        engine.next_line().await.unwrap(); // echo
        assert_eq!(engine.next_line().await.unwrap().unwrap(), "g1");
    }
}
