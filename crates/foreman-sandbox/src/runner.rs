use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use foreman_types::{EventKind, ForemanError, Result, WorkflowEvent};

use crate::paths::resolve_path;
use crate::policy::SandboxPolicy;

/// Callback used to publish sandbox events without depending on the bus.
pub type EventSink = Arc<dyn Fn(WorkflowEvent) + Send + Sync>;

/// Captured output is bounded; overflow is truncated and flagged so callers
/// can spill the full stream to an artifact instead.
pub const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Grace between the termination request and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Resolved through the path resolver; must land inside the root.
    pub cwd: PathBuf,
    /// Explicit extra variables, merged over the policy env allowlist.
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            cwd: cwd.into(),
            env: HashMap::new(),
            timeout: Duration::from_secs(120),
            stdin: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// Normalized: unknown or signal exits become -1.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub wall_time_ms: u64,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// One project's sandbox: every path and command funnels through here.
/// Concurrent invocations are isolated child processes with no shared
/// state; the child never inherits ambient credentials beyond the env
/// allowlist.
#[derive(Clone)]
pub struct Sandbox {
    project_id: String,
    root: PathBuf,
    policy: SandboxPolicy,
    events: Option<EventSink>,
}

impl Sandbox {
    pub fn new(project_id: impl Into<String>, root: impl Into<PathBuf>, policy: SandboxPolicy) -> Self {
        Self {
            project_id: project_id.into(),
            root: root.into(),
            policy,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn command_allowed(&self, command: &str) -> bool {
        self.policy.command_allowed(command)
    }

    /// Canonical in-root path or `Forbidden` plus a `security` event.
    pub fn resolve_path(&self, requested: &Path) -> Result<PathBuf> {
        match resolve_path(requested, &self.root, &self.policy) {
            Ok(path) => Ok(path),
            Err(err) => {
                self.emit_security("path_rejected", &format!("{err}"));
                Err(err)
            }
        }
    }

    pub async fn run(&self, spec: CommandSpec) -> Result<CommandOutcome> {
        self.run_cancellable(spec, CancellationToken::new()).await
    }

    pub async fn run_cancellable(
        &self,
        spec: CommandSpec,
        cancel: CancellationToken,
    ) -> Result<CommandOutcome> {
        if !self.policy.command_allowed(&spec.command) {
            self.emit_security(
                "command_rejected",
                &format!("command `{}` is not allowlisted", spec.command),
            );
            return Err(ForemanError::Forbidden(format!(
                "command `{}` is not allowlisted",
                spec.command
            )));
        }
        let cwd = self.resolve_path(&spec.cwd)?;

        let mut env: HashMap<String, String> = HashMap::new();
        for key in &self.policy.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.clone(), value);
            }
        }
        env.extend(spec.env.clone());

        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|err| ForemanError::Storage(format!("spawn `{}`: {err}", spec.command)))?;

        if let Some(input) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                let bytes = input.clone().into_bytes();
                tokio::spawn(async move {
                    let _ = stdin.write_all(&bytes).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let stdout_task = capture_stream(
            child.stdout.take(),
            self.events.clone(),
            self.project_id.clone(),
            "stdout",
        );
        let stderr_task = capture_stream(
            child.stderr.take(),
            self.events.clone(),
            self.project_id.clone(),
            "stderr",
        );

        let mut timed_out = false;
        let mut cancelled = false;
        let status = tokio::select! {
            status = child.wait() => Some(status
                .map_err(|err| ForemanError::Storage(format!("wait `{}`: {err}", spec.command)))?),
            _ = tokio::time::sleep(spec.timeout) => {
                timed_out = true;
                terminate(&mut child).await;
                None
            }
            _ = cancel.cancelled() => {
                cancelled = true;
                terminate(&mut child).await;
                None
            }
        };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

        if cancelled {
            return Err(ForemanError::Cancelled);
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let outcome = CommandOutcome {
            exit_code,
            stdout,
            stderr,
            wall_time_ms: started.elapsed().as_millis() as u64,
            timed_out,
            stdout_truncated,
            stderr_truncated,
        };

        if let Some(events) = &self.events {
            events(WorkflowEvent::new(
                EventKind::RunEnded,
                self.project_id.clone(),
                json!({
                    "command": spec.command,
                    "exitCode": outcome.exit_code,
                    "timedOut": outcome.timed_out,
                    "wallTimeMs": outcome.wall_time_ms,
                }),
            ));
        }

        Ok(outcome)
    }

    fn emit_security(&self, action: &str, detail: &str) {
        tracing::warn!(project_id = %self.project_id, action, detail, "sandbox violation");
        if let Some(events) = &self.events {
            events(WorkflowEvent::new(
                EventKind::Security,
                self.project_id.clone(),
                json!({"action": action, "detail": detail}),
            ));
        }
    }
}

/// Request termination, wait out the grace period, then force-kill.
async fn terminate(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

fn capture_stream<R>(
    stream: Option<R>,
    events: Option<EventSink>,
    project_id: String,
    channel: &'static str,
) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return (String::new(), false);
        };
        let mut captured: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = &buf[..n];
                    if captured.len() < MAX_CAPTURE_BYTES {
                        let room = MAX_CAPTURE_BYTES - captured.len();
                        captured.extend_from_slice(&chunk[..n.min(room)]);
                        if n > room {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                    if let Some(events) = &events {
                        events(WorkflowEvent::new(
                            EventKind::RunLog,
                            project_id.clone(),
                            json!({
                                "channel": channel,
                                "chunk": String::from_utf8_lossy(chunk),
                            }),
                        ));
                    }
                }
                Err(_) => break,
            }
        }
        (String::from_utf8_lossy(&captured).into_owned(), truncated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn policy_with(commands: &[&str]) -> SandboxPolicy {
        SandboxPolicy {
            allowed_commands: commands.iter().map(|c| c.to_string()).collect(),
            ..SandboxPolicy::default()
        }
    }

    fn collector() -> (EventSink, Arc<Mutex<Vec<WorkflowEvent>>>) {
        let seen: Arc<Mutex<Vec<WorkflowEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: EventSink = Arc::new(move |event| sink.lock().unwrap().push(event));
        (cb, seen)
    }

    #[tokio::test]
    async fn allowlisted_command_runs_and_captures_output() {
        let root = TempDir::new().unwrap();
        let sandbox = Sandbox::new("p-1", root.path(), policy_with(&["echo"]));
        let outcome = sandbox
            .run(CommandSpec::new("echo", vec!["hello".into()], root.path()))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.stdout.contains("hello"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn unlisted_command_is_forbidden_without_spawning() {
        let root = TempDir::new().unwrap();
        let (events, seen) = collector();
        let sandbox =
            Sandbox::new("p-1", root.path(), policy_with(&["echo"])).with_events(events);
        let err = sandbox
            .run(CommandSpec::new(
                "cat",
                vec!["../../etc/hostname".into()],
                root.path(),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|e| e.kind == EventKind::Security));
        assert!(!seen.iter().any(|e| e.kind == EventKind::RunEnded));
    }

    #[tokio::test]
    async fn cwd_outside_root_is_forbidden() {
        let root = TempDir::new().unwrap();
        let sandbox = Sandbox::new("p-1", root.path(), policy_with(&["echo"]));
        let err = sandbox
            .run(CommandSpec::new("echo", vec!["hi".into()], "/etc"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_flags_the_outcome() {
        let root = TempDir::new().unwrap();
        let sandbox = Sandbox::new("p-1", root.path(), policy_with(&["sleep"]));
        let mut spec = CommandSpec::new("sleep", vec!["30".into()], root.path());
        spec.timeout = Duration::from_millis(100);
        let outcome = sandbox.run(spec).await.unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.wall_time_ms < 10_000);
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let root = TempDir::new().unwrap();
        let sandbox = Sandbox::new("p-1", root.path(), policy_with(&["sleep"]));
        let cancel = CancellationToken::new();
        let handle = {
            let sandbox = sandbox.clone();
            let cancel = cancel.clone();
            let cwd = root.path().to_path_buf();
            tokio::spawn(async move {
                sandbox
                    .run_cancellable(CommandSpec::new("sleep", vec!["30".into()], cwd), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "cancelled");
    }

    #[tokio::test]
    async fn environment_is_built_from_the_allowlist_only() {
        let root = TempDir::new().unwrap();
        let mut policy = policy_with(&["env"]);
        policy.env_allowlist = vec!["PATH".into()];
        let sandbox = Sandbox::new("p-1", root.path(), policy);
        let mut spec = CommandSpec::new("env", vec![], root.path());
        spec.env.insert("FOREMAN_MARKER".into(), "on".into());
        let outcome = sandbox.run(spec).await.unwrap();
        assert!(outcome.stdout.contains("FOREMAN_MARKER=on"));
        assert!(!outcome.stdout.contains("HOME="));
    }

    #[tokio::test]
    async fn stdin_is_piped_to_the_child() {
        let root = TempDir::new().unwrap();
        let sandbox = Sandbox::new("p-1", root.path(), policy_with(&["cat"]));
        let mut spec = CommandSpec::new("cat", vec![], root.path());
        spec.stdin = Some("from stdin".into());
        let outcome = sandbox.run(spec).await.unwrap();
        assert_eq!(outcome.stdout, "from stdin");
    }
}
