use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman_engines::EngineRequest;
use foreman_sandbox::GateRunner;
use foreman_types::{
    ApprovalDecision, EventKind, ForemanError, GateReport, Phase, Result, Run, RunStatus, Task,
    TaskStatus, TaskVersion, WorkflowEvent,
};

use crate::context::build_coder_bundle;
use crate::PhaseOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoderRunStatus {
    /// All gates passed and the change was committed (or there was nothing
    /// to commit).
    Committed,
    /// Gates failed; the task went back to `APPROVED` for another attempt.
    GatesFailed,
    /// Gates failed and the attempt budget ran out; the task is `REJECTED`.
    Exhausted,
    /// The run was cancelled (pause or engine switch) with no side effects
    /// beyond the attempts counter.
    Cancelled,
}

#[derive(Debug)]
pub struct CoderOutcome {
    pub run: Run,
    pub task: Task,
    pub status: CoderRunStatus,
    pub gate_report: Option<GateReport>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// `ControlState.paused` was observed at a scheduling decision.
    Paused,
    /// No approved task with completed dependencies remains.
    NoReady,
}

#[derive(Debug)]
pub struct CoderLoopReport {
    pub outcomes: Vec<CoderOutcome>,
    pub stopped: LoopStop,
}

/// `<type>(task-<id> v<version>): <title>` plus the structured trailer.
pub fn commit_message(
    task: &Task,
    version: &TaskVersion,
    report: &GateReport,
    approver: &str,
    run_id: i64,
) -> String {
    let commit_type = task
        .metadata
        .commit_type
        .clone()
        .unwrap_or_else(|| "feat".to_string());
    format!(
        "{commit_type}(task-{} v{}): {}\n\nTask-Id: {}\nPhase: coder\nGates: {}\nApprover: {}\nRun-Id: {}\n",
        task.id,
        version.version,
        version.title,
        task.id,
        report.summary_line(),
        approver,
        run_id,
    )
}

impl PhaseOrchestrator {
    /// Coder phase for one approved task: engine session under the
    /// sandbox, gates, then either a structured commit or a retry.
    pub async fn run_coder(
        &self,
        task_id: i64,
        engine_name: Option<&str>,
    ) -> Result<CoderOutcome> {
        let ctx = self.context().clone();

        let control = ctx.store.control_state().await?;
        if control.paused {
            return Err(ForemanError::Preconditions("project is paused".into()));
        }
        let task = ctx.store.get_task(task_id).await?;
        if task.status != TaskStatus::Approved {
            return Err(ForemanError::Preconditions(format!(
                "task {task_id} is {}, coder runs require APPROVED",
                task.status.as_str()
            )));
        }
        let version = ctx.store.active_version(task_id).await?;
        for dep in &version.dependencies {
            let dep_task = ctx.store.get_task(*dep).await?;
            if dep_task.status != TaskStatus::Completed {
                return Err(ForemanError::Preconditions(format!(
                    "dependency task {dep} is {}, not COMPLETED",
                    dep_task.status.as_str()
                )));
            }
        }

        let engine = self.select_engine(engine_name).await?;
        let engine_id = engine.info().name;
        ctx.store
            .update_project(Some(Phase::Coder), None, None)
            .await?;
        let (run, cancel) = self
            .start_run(&engine_id, Phase::Coder, Some(task_id))
            .await?;
        ctx.store.set_current_task(Some(task_id)).await?;

        ctx.governance
            .set_task_status(task_id, TaskStatus::InProgress)
            .await?;
        let task = ctx.store.increment_attempts(task_id).await?;

        let result = self
            .coder_attempt(&task, &version, engine.clone(), run.clone(), cancel.clone())
            .await;
        ctx.store.set_current_task(None).await?;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(ForemanError::Cancelled) => {
                let run = self
                    .finish_run(run.id, RunStatus::Cancelled, None, None)
                    .await?;
                let task = ctx
                    .governance
                    .set_task_status(task_id, TaskStatus::Approved)
                    .await?;
                Ok(CoderOutcome {
                    run,
                    task,
                    status: CoderRunStatus::Cancelled,
                    gate_report: None,
                    commit_sha: None,
                })
            }
            Err(err) => {
                // Engine and parse failures never poison task state beyond
                // the attempts counter. The run may already be finished if
                // the attempt failed after its terminal transition.
                if let Err(finish_err) = self
                    .finish_run(run.id, RunStatus::Failure, None, Some(&err.to_string()))
                    .await
                {
                    tracing::debug!(run_id = run.id, ?finish_err, "run already finished");
                }
                let current = ctx.store.get_task(task_id).await?;
                if current.status == TaskStatus::InProgress {
                    ctx.governance
                        .set_task_status(task_id, TaskStatus::Approved)
                        .await?;
                }
                self.phase_failed(Phase::Coder, run.id, err.code());
                Err(err)
            }
        }
    }

    async fn coder_attempt(
        &self,
        task: &Task,
        version: &TaskVersion,
        engine: Arc<dyn foreman_engines::Engine>,
        run: Run,
        cancel: CancellationToken,
    ) -> Result<CoderOutcome> {
        let ctx = self.context().clone();
        let task_id = task.id;

        let bundle = build_coder_bundle(&ctx, version).await?;
        self.put_artifact(
            bundle.rendered.as_bytes(),
            foreman_types::ArtifactKind::Other,
            Some(run.id),
            Some(task_id),
        )
        .await?;

        self.check_pause(&cancel).await?;

        tracing::debug!(
            task_id,
            prompt = %foreman_observability::redact_text(&bundle.rendered),
            "starting coder engine session"
        );
        let mut session = engine
            .start(EngineRequest {
                prompt: format!(
                    "Implement the task below and stop when done.\n\n{}",
                    bundle.rendered
                ),
                context: Vec::new(),
                workdir: ctx.root.clone(),
            })
            .await?;

        // A pause taking effect mid-session aborts it cleanly: the watcher
        // trips the run token, the engine stream completes within its
        // grace period, and the interruption is recorded as CANCELLED.
        let pause_watch = {
            let store = ctx.store.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    match store.control_state().await {
                        Ok(control) if control.paused => {
                            cancel.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            })
        };
        let transcript = self.drain_session(&mut session, run.id, &cancel).await;
        pause_watch.abort();
        let transcript = transcript?;

        self.persist_transcript(&transcript, run.id, Some(task_id))
            .await?;
        self.check_pause(&cancel).await?;

        let config = ctx.config().await;
        let report = if config.gates.enabled && !version.gates.is_empty() {
            let bus = ctx.bus.clone();
            let project_id = ctx.project_id.clone();
            let sink: foreman_sandbox::EventSink = Arc::new(move |event: WorkflowEvent| {
                bus.publish(event);
            });
            let runner = GateRunner::new(ctx.sandbox().await, project_id)
                .with_default_timeout(Duration::from_secs(config.gates.timeout))
                .with_fail_fast(config.gates.fail_on_error)
                .with_events(sink);
            runner
                .run_gates(&version.gates, ctx.root.clone(), cancel.clone())
                .await?
        } else {
            GateReport::from_results(Vec::new())
        };

        if report.all_passed {
            let commit_sha = self.commit_task(task, version, &report, run.id).await?;
            let run = self
                .finish_run(run.id, RunStatus::Success, Some(&report), None)
                .await?;
            let task = ctx
                .governance
                .set_task_status(task_id, TaskStatus::Completed)
                .await?;
            self.phase_completed(Phase::Coder, run.id, "success");
            return Ok(CoderOutcome {
                run,
                task,
                status: CoderRunStatus::Committed,
                gate_report: Some(report),
                commit_sha,
            });
        }

        // Preserve the failed attempt's diff for the next context bundle.
        let vcs = ctx.vcs().await;
        if let Ok(diff) = vcs.diff(&ctx.root).await {
            if !diff.trim().is_empty() {
                self.put_artifact(
                    diff.as_bytes(),
                    foreman_types::ArtifactKind::Diff,
                    Some(run.id),
                    Some(task_id),
                )
                .await?;
            }
        }

        let run = self
            .finish_run(run.id, RunStatus::Failure, Some(&report), Some("gates_failed"))
            .await?;
        let control = ctx.store.control_state().await?;
        let current = ctx.store.get_task(task_id).await?;
        let (task, status) = if current.attempts >= control.max_attempts {
            let task = ctx
                .governance
                .set_task_status(task_id, TaskStatus::Rejected)
                .await?;
            let mut metadata = task.metadata.clone();
            metadata.reason = Some("exhausted".to_string());
            let task = ctx.store.set_task_metadata(task_id, &metadata).await?;
            (task, CoderRunStatus::Exhausted)
        } else {
            let task = ctx
                .governance
                .set_task_status(task_id, TaskStatus::Approved)
                .await?;
            (task, CoderRunStatus::GatesFailed)
        };
        self.phase_completed(Phase::Coder, run.id, "gates_failed");

        Ok(CoderOutcome {
            run,
            task,
            status,
            gate_report: Some(report),
            commit_sha: None,
        })
    }

    async fn commit_task(
        &self,
        task: &Task,
        version: &TaskVersion,
        report: &GateReport,
        run_id: i64,
    ) -> Result<Option<String>> {
        let ctx = self.context().clone();
        let vcs = ctx.vcs().await;
        if !vcs.is_repo(&ctx.root).await? {
            tracing::warn!(task_id = task.id, "project root is not a repository; skipping commit");
            return Ok(None);
        }
        let status = vcs.status(&ctx.root).await?;
        let mut files: Vec<PathBuf> = Vec::new();
        for path in status.staged.iter().chain(status.unstaged.iter()) {
            // Internal state never lands in the repository.
            if path.starts_with(".foreman") {
                continue;
            }
            let path = PathBuf::from(path);
            if !files.contains(&path) {
                files.push(path);
            }
        }
        if files.is_empty() {
            tracing::info!(task_id = task.id, "no changes to commit");
            return Ok(None);
        }

        let approver = self.version_approver(version).await?;
        let message = commit_message(task, version, report, &approver, run_id);
        let sha = vcs.commit(&ctx.root, &files, &message).await?;
        Ok(Some(sha))
    }

    async fn version_approver(&self, version: &TaskVersion) -> Result<String> {
        // The review approval may sit on an earlier version of the task
        // (refinements create new versions without re-approval).
        let versions = self.context().store.task_versions(version.task_id).await?;
        for candidate in versions.iter().rev() {
            let approvals = self
                .context()
                .store
                .approvals_for_version(candidate.id)
                .await?;
            if let Some(approval) = approvals
                .iter()
                .rev()
                .find(|a| a.decision == ApprovalDecision::Approve)
            {
                return Ok(approval.approver.clone());
            }
        }
        Ok("unknown".to_string())
    }

    async fn check_pause(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(ForemanError::Cancelled);
        }
        let control = self.context().store.control_state().await?;
        if control.paused {
            return Err(ForemanError::Cancelled);
        }
        Ok(())
    }

    /// The per-project coder loop:
    ///
    /// Idle → Selecting → Executing → Committing → back to Selecting, with
    /// pause observed at every scheduling decision. Scheduling decisions
    /// happen under the project control lock.
    pub async fn run_coder_loop(&self, engine_name: Option<&str>) -> Result<CoderLoopReport> {
        let ctx = self.context().clone();
        let mut outcomes = Vec::new();
        let stopped = loop {
            // Selecting
            let next = {
                let _guard = ctx.control_lock.lock().await;
                let control = ctx.store.control_state().await?;
                if control.paused {
                    break LoopStop::Paused;
                }
                self.next_ready_task().await?
            };
            let Some(task_id) = next else {
                break LoopStop::NoReady;
            };

            // Executing / Committing
            let outcome = self.run_coder(task_id, engine_name).await?;
            let cancelled = outcome.status == CoderRunStatus::Cancelled;
            outcomes.push(outcome);
            if cancelled {
                let control = ctx.store.control_state().await?;
                if control.paused {
                    break LoopStop::Paused;
                }
                // An engine switch cancelled the run; re-select with the
                // new engine.
            }
        };
        self.publish(
            EventKind::ProjectUpdated,
            json!({"coderLoop": match stopped {
                LoopStop::Paused => "paused",
                LoopStop::NoReady => "idle",
            }}),
        );
        Ok(CoderLoopReport { outcomes, stopped })
    }

    /// Highest-priority `APPROVED` task whose dependencies are all
    /// `COMPLETED`.
    async fn next_ready_task(&self) -> Result<Option<i64>> {
        let ctx = self.context();
        let approved = ctx.store.list_tasks(Some(TaskStatus::Approved)).await?;
        for task in approved {
            let version = ctx.store.active_version(task.id).await?;
            let mut ready = true;
            for dep in &version.dependencies {
                let dep_task = ctx.store.get_task(*dep).await?;
                if dep_task.status != TaskStatus::Completed {
                    ready = false;
                    break;
                }
            }
            if ready {
                return Ok(Some(task.id));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{approved_task, fixture_with_engine, gate, init_repo};
    use foreman_sandbox::CommandSpec;

    #[tokio::test]
    async fn coder_requires_an_approved_task() {
        let fixture = fixture_with_engine("done").await;
        let task = fixture
            .ctx
            .governance
            .create_task(
                &foreman_types::TaskSpec {
                    title: "Unapproved".into(),
                    ..Default::default()
                },
                Phase::Planner,
            )
            .await
            .unwrap();
        let err = fixture
            .orchestrator
            .run_coder(task.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "preconditions");
    }

    #[tokio::test]
    async fn coder_refuses_to_start_while_paused() {
        let fixture = fixture_with_engine("done").await;
        let task = approved_task(&fixture.ctx, "Paused work", vec![gate("ok", "true")]).await;
        fixture.ctx.store.set_paused(true).await.unwrap();
        let err = fixture
            .orchestrator
            .run_coder(task.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "preconditions");
    }

    #[tokio::test]
    async fn gate_failure_reverts_to_approved_and_counts_the_attempt() {
        let fixture = fixture_with_engine("attempted an implementation").await;
        init_repo(&fixture.ctx).await;
        let task = approved_task(&fixture.ctx, "Flaky work", vec![gate("tests", "false")]).await;

        let outcome = fixture.orchestrator.run_coder(task.id, None).await.unwrap();
        assert_eq!(outcome.status, CoderRunStatus::GatesFailed);
        assert_eq!(outcome.commit_sha, None);
        assert_eq!(outcome.run.status, RunStatus::Failure);

        let task = fixture.ctx.store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert_eq!(task.attempts, 1);

        let events = fixture.ctx.bus.replay_since(0);
        assert!(events.iter().any(|e| e.kind == EventKind::GateFailed));
        assert!(!events.iter().any(|e| e.kind == EventKind::VcsCommitted));
    }

    #[tokio::test]
    async fn exhausted_attempts_reject_the_task() {
        let fixture = fixture_with_engine("attempt").await;
        init_repo(&fixture.ctx).await;
        fixture.ctx.store.set_max_attempts(1).await.unwrap();
        let task = approved_task(&fixture.ctx, "Doomed work", vec![gate("tests", "false")]).await;

        let outcome = fixture.orchestrator.run_coder(task.id, None).await.unwrap();
        assert_eq!(outcome.status, CoderRunStatus::Exhausted);

        let task = fixture.ctx.store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Rejected);
        assert_eq!(task.metadata.reason.as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn successful_run_commits_with_structured_message() {
        let fixture = fixture_with_engine("implemented the login flow").await;
        init_repo(&fixture.ctx).await;

        // Two passing gates and a third version of the task.
        let task = approved_task(
            &fixture.ctx,
            "Add login",
            vec![gate("fmt", "true"), gate("tests", "true")],
        )
        .await;
        // The approval above targets the active version; refine twice via
        // sanctioned edits to reach v3.
        let cr = fixture
            .ctx
            .governance
            .create_change_request(
                task.id,
                foreman_types::ChangeKind::Edit,
                &foreman_types::ChangeDelta::default(),
            )
            .await
            .unwrap();
        fixture
            .ctx
            .governance
            .submit_change_request(cr.id)
            .await
            .unwrap();
        fixture
            .ctx
            .governance
            .approve_change_request(cr.id, "alice", None)
            .await
            .unwrap();
        fixture
            .ctx
            .governance
            .update_task(
                task.id,
                &foreman_types::TaskSpec {
                    title: "Add login".into(),
                    description: "refined".into(),
                    gates: vec![gate("fmt", "true"), gate("tests", "true")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        fixture
            .ctx
            .governance
            .update_task(
                task.id,
                &foreman_types::TaskSpec {
                    title: "Add login".into(),
                    description: "refined again".into(),
                    gates: vec![gate("fmt", "true"), gate("tests", "true")],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let version = fixture.ctx.store.active_version(task.id).await.unwrap();
        assert_eq!(version.version, 3);

        // Simulate the engine's file edit.
        std::fs::write(fixture.ctx.root.join("login.rs"), "pub fn login() {}\n").unwrap();

        let outcome = fixture.orchestrator.run_coder(task.id, None).await.unwrap();
        assert_eq!(outcome.status, CoderRunStatus::Committed);
        let sha = outcome.commit_sha.clone().expect("commit sha");
        assert_eq!(sha.len(), 40);

        let task = fixture.ctx.store.get_task(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let log = fixture
            .ctx
            .sandbox()
            .await
            .run(CommandSpec::new(
                "git",
                vec!["log".into(), "-1".into(), "--format=%B".into()],
                fixture.ctx.root.clone(),
            ))
            .await
            .unwrap();
        let first_line = log.stdout.lines().next().unwrap_or_default().to_string();
        assert_eq!(
            first_line,
            format!("feat(task-{} v3): Add login", task.id)
        );
        assert!(log.stdout.contains("Gates: 2/2 passed"));
        assert!(log.stdout.contains("Approver: alice"));
        assert!(log.stdout.contains(&format!("Task-Id: {}", task.id)));
    }

    #[tokio::test]
    async fn completed_task_has_a_passing_success_run() {
        let fixture = fixture_with_engine("done").await;
        init_repo(&fixture.ctx).await;
        let task = approved_task(&fixture.ctx, "Invariant", vec![gate("ok", "true")]).await;
        std::fs::write(fixture.ctx.root.join("work.txt"), "change\n").unwrap();

        fixture.orchestrator.run_coder(task.id, None).await.unwrap();
        assert!(fixture.ctx.store.has_passing_run(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn coder_loop_drains_ready_tasks_then_idles() {
        let fixture = fixture_with_engine("done").await;
        init_repo(&fixture.ctx).await;
        let first = approved_task(&fixture.ctx, "First", vec![gate("ok", "true")]).await;
        let second = approved_task(&fixture.ctx, "Second", vec![gate("ok", "true")]).await;
        std::fs::write(fixture.ctx.root.join("work.txt"), "change\n").unwrap();

        let report = fixture.orchestrator.run_coder_loop(None).await.unwrap();
        assert_eq!(report.stopped, LoopStop::NoReady);
        assert_eq!(report.outcomes.len(), 2);
        for id in [first.id, second.id] {
            let task = fixture.ctx.store.get_task(id).await.unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
    }

    #[tokio::test]
    async fn coder_loop_respects_pause() {
        let fixture = fixture_with_engine("done").await;
        init_repo(&fixture.ctx).await;
        approved_task(&fixture.ctx, "Never run", vec![gate("ok", "true")]).await;
        fixture.ctx.store.set_paused(true).await.unwrap();

        let report = fixture.orchestrator.run_coder_loop(None).await.unwrap();
        assert_eq!(report.stopped, LoopStop::Paused);
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn commit_message_shape() {
        use chrono::Utc;
        let task = Task {
            id: 12,
            project_id: "p".into(),
            title: "Add login".into(),
            description: String::new(),
            priority: 0,
            status: TaskStatus::Approved,
            phase: Phase::Coder,
            attempts: 1,
            active_version_id: Some(3),
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let version = TaskVersion {
            id: 3,
            task_id: 12,
            version: 3,
            title: "Add login".into(),
            description: String::new(),
            acceptance_criteria: vec![],
            dependencies: vec![],
            gates: vec![],
            phase: Phase::Coder,
            created_at: Utc::now(),
        };
        let report = GateReport::from_results(vec![
            foreman_types::GateResult {
                name: "fmt".into(),
                passed: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                error: None,
            },
            foreman_types::GateResult {
                name: "tests".into(),
                passed: true,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 1,
                error: None,
            },
        ]);
        let message = commit_message(&task, &version, &report, "alice", 9);
        assert!(message.starts_with("feat(task-12 v3): Add login\n"));
        assert!(message.contains("Gates: 2/2 passed"));
        assert!(message.contains("Approver: alice"));
        assert!(message.contains("Run-Id: 9"));
    }
}
