use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman_types::{
    EventKind, ForemanError, GateReport, GateResult, GateSpec, PassCriteria, Result,
    WorkflowEvent,
};

use crate::runner::{CommandSpec, EventSink, Sandbox};

/// Executes a task's ordered gate list through the sandbox and evaluates
/// the pass criteria. Gate timeouts are gate failures, never phase
/// failures.
pub struct GateRunner {
    sandbox: Sandbox,
    project_id: String,
    default_timeout: Duration,
    /// Stop at the first failing gate instead of running all and reporting
    /// all (the default).
    fail_fast: bool,
    events: Option<EventSink>,
}

impl GateRunner {
    pub fn new(sandbox: Sandbox, project_id: impl Into<String>) -> Self {
        Self {
            sandbox,
            project_id: project_id.into(),
            default_timeout: Duration::from_secs(300),
            fail_fast: false,
            events: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn run_gates(
        &self,
        gates: &[GateSpec],
        cwd: PathBuf,
        cancel: CancellationToken,
    ) -> Result<GateReport> {
        let mut results = Vec::with_capacity(gates.len());
        for gate in gates {
            if cancel.is_cancelled() {
                return Err(ForemanError::Cancelled);
            }
            let result = self.run_gate(gate, cwd.clone(), cancel.clone()).await?;
            let failed = !result.passed;
            self.emit(&result);
            results.push(result);
            if failed && self.fail_fast {
                break;
            }
        }
        Ok(GateReport::from_results(results))
    }

    async fn run_gate(
        &self,
        gate: &GateSpec,
        cwd: PathBuf,
        cancel: CancellationToken,
    ) -> Result<GateResult> {
        // An unlisted command reports forbidden without ever spawning.
        if !self.sandbox.command_allowed(&gate.command) {
            return Ok(GateResult {
                name: gate.name.clone(),
                passed: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
                error: Some("forbidden".into()),
            });
        }

        let mut spec = CommandSpec::new(gate.command.clone(), gate.args.clone(), cwd);
        spec.timeout = gate
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let outcome = match self.sandbox.run_cancellable(spec, cancel).await {
            Ok(outcome) => outcome,
            Err(ForemanError::Cancelled) => return Err(ForemanError::Cancelled),
            Err(err) => {
                return Ok(GateResult {
                    name: gate.name.clone(),
                    passed: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration_ms: 0,
                    error: Some(err.to_string()),
                })
            }
        };

        let mut error = None;
        let passed = if outcome.timed_out {
            error = Some("timeout".into());
            false
        } else {
            match evaluate(gate, outcome.exit_code, &outcome.stdout, &outcome.stderr) {
                Ok(passed) => passed,
                Err(reason) => {
                    error = Some(reason);
                    false
                }
            }
        };

        Ok(GateResult {
            name: gate.name.clone(),
            passed,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.wall_time_ms,
            error,
        })
    }

    fn emit(&self, result: &GateResult) {
        let Some(events) = &self.events else { return };
        let payload = json!({
            "gate": result.name,
            "passed": result.passed,
            "exitCode": result.exit_code,
            "durationMs": result.duration_ms,
            "error": result.error,
        });
        events(WorkflowEvent::new(
            EventKind::GateExecuted,
            self.project_id.clone(),
            payload.clone(),
        ));
        let kind = if result.passed {
            EventKind::GatePassed
        } else {
            EventKind::GateFailed
        };
        events(WorkflowEvent::new(kind, self.project_id.clone(), payload));
    }
}

fn evaluate(
    gate: &GateSpec,
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> std::result::Result<bool, String> {
    let haystack = if gate.match_stderr { stderr } else { stdout };
    match gate.pass_criteria {
        PassCriteria::ExitCodeZero => Ok(exit_code == 0),
        PassCriteria::OutputContains => {
            let expected = gate
                .expected
                .as_deref()
                .ok_or_else(|| "missing expected value".to_string())?;
            Ok(haystack.contains(expected))
        }
        PassCriteria::OutputMatches => {
            let expected = gate
                .expected
                .as_deref()
                .ok_or_else(|| "missing expected pattern".to_string())?;
            let regex = Regex::new(expected).map_err(|err| format!("invalid pattern: {err}"))?;
            Ok(regex.is_match(haystack))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SandboxPolicy;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn runner(root: &std::path::Path, commands: &[&str]) -> GateRunner {
        let policy = SandboxPolicy {
            allowed_commands: commands.iter().map(|c| c.to_string()).collect(),
            ..SandboxPolicy::default()
        };
        GateRunner::new(Sandbox::new("p-1", root, policy), "p-1")
    }

    fn gate(name: &str, command: &str, args: &[&str]) -> GateSpec {
        GateSpec {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            pass_criteria: PassCriteria::ExitCodeZero,
            expected: None,
            timeout_secs: Some(30),
            match_stderr: false,
        }
    }

    #[tokio::test]
    async fn exit_code_zero_criteria() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["true", "false"]);
        let gates = vec![gate("ok", "true", &[]), gate("bad", "false", &[])];
        let report = runner
            .run_gates(&gates, root.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.passed, 1);
        assert!(!report.all_passed);
        assert!(report.results[0].passed);
        assert!(!report.results[1].passed);
        assert_eq!(report.results[1].exit_code, 1);
    }

    #[tokio::test]
    async fn output_contains_criteria() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["echo"]);
        let mut spec = gate("greets", "echo", &["hello world"]);
        spec.pass_criteria = PassCriteria::OutputContains;
        spec.expected = Some("hello".into());
        let report = runner
            .run_gates(&[spec], root.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.all_passed);
    }

    #[tokio::test]
    async fn output_matches_at_end_boundary() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["echo"]);
        let mut spec = gate("pattern", "echo", &["all checks ok"]);
        spec.pass_criteria = PassCriteria::OutputMatches;
        // echo appends a newline; the pattern must still match at the end.
        spec.expected = Some(r"ok\s*$".into());
        let report = runner
            .run_gates(&[spec], root.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.all_passed);
    }

    #[tokio::test]
    async fn forbidden_gate_does_not_execute() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["true"]);
        let report = runner
            .run_gates(
                &[gate("evil", "rm", &["-rf", "/"])],
                root.path().to_path_buf(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.results[0].error.as_deref(), Some("forbidden"));
        assert_eq!(report.results[0].exit_code, -1);
    }

    #[tokio::test]
    async fn gate_timeout_is_a_gate_failure() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["sleep"]);
        let mut spec = gate("slow", "sleep", &["30"]);
        spec.timeout_secs = Some(0);
        let report = runner
            .run_gates(&[spec], root.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.all_passed);
        assert_eq!(report.results[0].error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn fail_fast_short_circuits_but_reports_executed_gates() {
        let root = TempDir::new().unwrap();
        let runner = runner(root.path(), &["true", "false"]).with_fail_fast(true);
        let gates = vec![
            gate("first", "false", &[]),
            gate("second", "true", &[]),
        ];
        let report = runner
            .run_gates(&gates, root.path().to_path_buf(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        assert!(!report.all_passed);
    }

    #[tokio::test]
    async fn gate_events_are_published() {
        let root = TempDir::new().unwrap();
        let seen: Arc<Mutex<Vec<EventKind>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let runner = runner(root.path(), &["true"]).with_events(Arc::new(move |event| {
            sink.lock().unwrap().push(event.kind);
        }));
        runner
            .run_gates(
                &[gate("ok", "true", &[])],
                root.path().to_path_buf(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&EventKind::GateExecuted));
        assert!(seen.contains(&EventKind::GatePassed));
    }
}
