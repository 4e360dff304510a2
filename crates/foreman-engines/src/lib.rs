use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use foreman_sandbox::Sandbox;
use foreman_types::{ForemanError, Result};

/// Static description of one configured engine adapter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// External binary to execute. Must be allowlisted in the sandbox.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnginesConfig {
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
    pub default_engine: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub name: String,
    pub kind: String,
}

/// What the orchestrator hands an engine: the rendered prompt plus context
/// documents already pulled out of the artifact store.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub prompt: String,
    pub context: Vec<String>,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone)]
pub enum EngineChunk {
    Text(String),
    /// Diagnostic output (the CLI adapter's stderr).
    Log(String),
    Done { reason: String },
}

pub type EngineStream = Pin<Box<dyn Stream<Item = Result<EngineChunk>> + Send>>;

/// A live engine session. `stop` requests termination; the stream then
/// completes within the adapter's grace period (the CLI adapter force-kills
/// the child after it).
pub struct EngineSession {
    stream: EngineStream,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession").finish_non_exhaustive()
    }
}

impl EngineSession {
    pub fn new(stream: EngineStream, cancel: CancellationToken) -> Self {
        Self { stream, cancel }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<EngineChunk>> {
        self.stream.next().await
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the session into one transcript string.
    pub async fn collect_text(&mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(chunk) = self.next_chunk().await {
            match chunk? {
                EngineChunk::Text(text) => out.push_str(&text),
                EngineChunk::Log(_) => {}
                EngineChunk::Done { .. } => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
pub trait Engine: Send + Sync {
    fn info(&self) -> EngineInfo;
    async fn start(&self, req: EngineRequest) -> Result<EngineSession>;
}

impl std::fmt::Debug for dyn Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Engine").field("info", &self.info()).finish()
    }
}

/// Explicit stub used when no engine is configured: starting a session
/// fails cleanly instead of hanging a phase run.
pub struct NullEngine;

#[async_trait]
impl Engine for NullEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "null".to_string(),
            kind: "null".to_string(),
        }
    }

    async fn start(&self, _req: EngineRequest) -> Result<EngineSession> {
        Err(ForemanError::EngineFailure(
            "no engine configured for this project".to_string(),
        ))
    }
}

/// Fixed-output engine. Useful as a deterministic stand-in when wiring a
/// project before a real CLI is configured, and in tests.
pub struct StaticEngine {
    name: String,
    output: String,
}

impl StaticEngine {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
        }
    }
}

#[async_trait]
impl Engine for StaticEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: self.name.clone(),
            kind: "static".to_string(),
        }
    }

    async fn start(&self, _req: EngineRequest) -> Result<EngineSession> {
        let cancel = CancellationToken::new();
        let output = self.output.clone();
        let stream = futures::stream::iter(vec![
            Ok(EngineChunk::Text(output)),
            Ok(EngineChunk::Done {
                reason: "stop".to_string(),
            }),
        ]);
        Ok(EngineSession::new(Box::pin(stream), cancel))
    }
}

/// Grace between a stop request and the hard kill of the engine child.
const STOP_GRACE: Duration = Duration::from_secs(3);

/// One scheduling step of the CLI engine stream.
enum Step {
    Stdout(String),
    Stderr(String),
    Idle,
    Finished { reason: String },
}

/// Wraps an external AI CLI. The prompt goes to the child's stdin, context
/// documents are appended after a blank line, and stdout lines stream back
/// as opaque text chunks. The command must pass the project sandbox.
pub struct CliEngine {
    name: String,
    config: EngineConfig,
    sandbox: Sandbox,
}

impl CliEngine {
    pub fn new(name: impl Into<String>, config: EngineConfig, sandbox: Sandbox) -> Self {
        Self {
            name: name.into(),
            config,
            sandbox,
        }
    }
}

#[async_trait]
impl Engine for CliEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: self.name.clone(),
            kind: "cli".to_string(),
        }
    }

    async fn start(&self, req: EngineRequest) -> Result<EngineSession> {
        if !self.sandbox.command_allowed(&self.config.command) {
            return Err(ForemanError::Forbidden(format!(
                "engine command `{}` is not allowlisted",
                self.config.command
            )));
        }
        let cwd = self.sandbox.resolve_path(&req.workdir)?;

        let mut env: HashMap<String, String> = HashMap::new();
        for key in &self.sandbox.policy().env_allowlist {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }

        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ForemanError::EngineFailure(format!(
                    "spawn engine `{}`: {err}",
                    self.config.command
                ))
            })?;

        let mut input = req.prompt;
        for document in &req.context {
            input.push_str("\n\n");
            input.push_str(document);
        }
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            ForemanError::EngineFailure("engine child has no stdout".to_string())
        })?;
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        let stream_cancel = cancel.clone();
        let engine_name = self.name.clone();
        let stream = try_stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut err_lines = stderr.map(|s| BufReader::new(s).lines());
            loop {
                let step: Result<Step> = tokio::select! {
                    _ = stream_cancel.cancelled() => {
                        let _ = child.start_kill();
                        if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_err() {
                            let _ = child.kill().await;
                            let _ = child.wait().await;
                        }
                        Ok(Step::Finished { reason: "cancelled".to_string() })
                    }
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(mut text)) => {
                                text.push('\n');
                                Ok(Step::Stdout(text))
                            }
                            Ok(None) => match child.wait().await {
                                Ok(status) => {
                                    let reason = if status.success() {
                                        "stop".to_string()
                                    } else {
                                        format!("exit_{}", status.code().unwrap_or(-1))
                                    };
                                    Ok(Step::Finished { reason })
                                }
                                Err(err) => Err(ForemanError::EngineFailure(format!(
                                    "engine `{engine_name}` wait: {err}"
                                ))),
                            },
                            Err(err) => Err(ForemanError::EngineFailure(format!(
                                "engine `{engine_name}` read: {err}"
                            ))),
                        }
                    }
                    err_line = read_optional_line(&mut err_lines) => {
                        Ok(match err_line {
                            Some(text) => Step::Stderr(text),
                            None => Step::Idle,
                        })
                    }
                };
                match step? {
                    Step::Stdout(text) => yield EngineChunk::Text(text),
                    Step::Stderr(text) => yield EngineChunk::Log(text),
                    Step::Idle => {}
                    Step::Finished { reason } => {
                        yield EngineChunk::Done { reason };
                        break;
                    }
                }
            }
        };

        Ok(EngineSession::new(Box::pin(stream), cancel))
    }
}

/// Pending-forever when stderr is absent or drained, so the select never
/// spins on it.
async fn read_optional_line(
    lines: &mut Option<tokio::io::Lines<BufReader<tokio::process::ChildStderr>>>,
) -> Option<String> {
    match lines {
        Some(reader) => match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            _ => {
                *lines = None;
                futures::future::pending::<()>().await;
                None
            }
        },
        None => {
            futures::future::pending::<()>().await;
            None
        }
    }
}

/// Engine lookup with a configured default and first-available fallback,
/// falling back to the null stub when nothing is configured.
#[derive(Clone)]
pub struct EngineRegistry {
    engines: Arc<RwLock<Vec<Arc<dyn Engine>>>>,
    default_engine: Arc<RwLock<Option<String>>>,
}

impl EngineRegistry {
    pub fn new(config: EnginesConfig, sandbox: Sandbox) -> Self {
        let engines = build_engines(&config, &sandbox);
        Self {
            engines: Arc::new(RwLock::new(engines)),
            default_engine: Arc::new(RwLock::new(config.default_engine)),
        }
    }

    /// Used by tests and in-process wiring to register custom adapters.
    pub async fn register(&self, engine: Arc<dyn Engine>) {
        self.engines.write().await.push(engine);
    }

    pub async fn reload(&self, config: EnginesConfig, sandbox: Sandbox) {
        let rebuilt = build_engines(&config, &sandbox);
        *self.engines.write().await = rebuilt;
        *self.default_engine.write().await = config.default_engine;
    }

    pub async fn list(&self) -> Vec<EngineInfo> {
        self.engines.read().await.iter().map(|e| e.info()).collect()
    }

    pub async fn select(&self, engine_name: Option<&str>) -> Result<Arc<dyn Engine>> {
        let engines = self.engines.read().await;
        let available = engines
            .iter()
            .map(|e| e.info().name)
            .collect::<Vec<_>>();

        if let Some(name) = engine_name {
            if let Some(engine) = engines.iter().find(|e| e.info().name == name) {
                return Ok(engine.clone());
            }
            return Err(ForemanError::NotFound(format!(
                "engine `{name}` is not configured. configured engines: {}",
                available.join(", ")
            )));
        }

        let configured_default = self.default_engine.read().await.clone();
        if let Some(default_name) = configured_default {
            if let Some(engine) = engines.iter().find(|e| e.info().name == default_name) {
                return Ok(engine.clone());
            }
        }

        engines
            .first()
            .cloned()
            .ok_or_else(|| ForemanError::EngineFailure("no engine configured".to_string()))
    }
}

fn build_engines(config: &EnginesConfig, sandbox: &Sandbox) -> Vec<Arc<dyn Engine>> {
    let mut engines: Vec<Arc<dyn Engine>> = Vec::new();
    let mut names: Vec<&String> = config.engines.keys().collect();
    names.sort();
    for name in names {
        let engine_config = &config.engines[name];
        engines.push(Arc::new(CliEngine::new(
            name.clone(),
            engine_config.clone(),
            sandbox.clone(),
        )));
    }
    if engines.is_empty() {
        engines.push(Arc::new(NullEngine));
    }
    engines
}
