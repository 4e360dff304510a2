use std::sync::Arc;

use tempfile::TempDir;

use foreman_core::{ProjectContext, ProjectRegistry};
use foreman_engines::StaticEngine;
use foreman_sandbox::CommandSpec;
use foreman_types::{ApprovalDecision, GateSpec, PassCriteria, Task, TaskSpec};

use crate::PhaseOrchestrator;

pub(crate) struct Fixture {
    pub registry: ProjectRegistry,
    pub ctx: Arc<ProjectContext>,
    pub orchestrator: PhaseOrchestrator,
    _state: TempDir,
    _work: TempDir,
}

/// A project whose default engine is a `StaticEngine` emitting `output`,
/// with a permissive command allowlist for gate/VCS tests.
pub(crate) async fn fixture_with_engine(output: &str) -> Fixture {
    let state = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let root = work.path().join("demo");
    std::fs::create_dir_all(&root).unwrap();

    let config = serde_json::json!({
        "default_engine": "static",
        "sandbox": {
            "allowed_commands": ["git", "true", "false", "echo", "cat", "sleep", "env"]
        }
    });
    std::fs::write(root.join("foreman.json"), config.to_string()).unwrap();

    let registry = ProjectRegistry::load(state.path()).await.unwrap();
    let project = registry
        .create_project("demo", &root, Some("static"))
        .await
        .unwrap();
    let ctx = registry.context(&project.id).await.unwrap();
    ctx.engines
        .register(Arc::new(StaticEngine::new("static", output)))
        .await;
    let orchestrator = PhaseOrchestrator::new(ctx.clone());

    Fixture {
        registry,
        ctx,
        orchestrator,
        _state: state,
        _work: work,
    }
}

pub(crate) async fn init_repo(ctx: &ProjectContext) {
    let vcs = ctx.vcs().await;
    vcs.init(&ctx.root).await.unwrap();
    let sandbox = ctx.sandbox().await;
    for args in [
        vec!["config", "user.email", "foreman@example.com"],
        vec!["config", "user.name", "Foreman"],
    ] {
        sandbox
            .run(CommandSpec::new(
                "git",
                args.into_iter().map(String::from).collect(),
                ctx.root.clone(),
            ))
            .await
            .unwrap();
    }
}

pub(crate) fn gate(name: &str, command: &str) -> GateSpec {
    GateSpec {
        name: name.into(),
        command: command.into(),
        args: Vec::new(),
        pass_criteria: PassCriteria::ExitCodeZero,
        expected: None,
        timeout_secs: Some(30),
        match_stderr: false,
    }
}

/// Create a task with the given gates and walk it to `APPROVED` by
/// "alice".
pub(crate) async fn approved_task(ctx: &ProjectContext, title: &str, gates: Vec<GateSpec>) -> Task {
    let task = ctx
        .governance
        .create_task(
            &TaskSpec {
                title: title.into(),
                description: format!("{title} description"),
                gates,
                ..Default::default()
            },
            foreman_types::Phase::Planner,
        )
        .await
        .unwrap();
    ctx.governance.submit_for_approval(task.id).await.unwrap();
    let (task, _) = ctx
        .governance
        .decide_task(task.id, "alice", ApprovalDecision::Approve, None)
        .await
        .unwrap();
    task
}
