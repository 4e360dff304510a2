use foreman_engines::EngineRequest;
use foreman_types::{
    ArtifactKind, ArtifactMeta, ForemanError, Phase, Result, Run, RunStatus, Task, TaskSpec,
    TaskStatus,
};

use crate::context::{render_task_brief, ARCHITECT_INSTRUCTIONS};
use crate::parse::parse_architecture;
use crate::PhaseOrchestrator;

#[derive(Debug)]
pub struct ArchitectOutcome {
    pub run: Run,
    pub transcript_artifact: ArtifactMeta,
    pub architecture_artifact: ArtifactMeta,
    pub adr_artifacts: Vec<ArtifactMeta>,
    pub refined_tasks: Vec<Task>,
}

impl PhaseOrchestrator {
    /// Architect phase for one task: bundles plan, spec, and prior ADRs as
    /// context, expects options + ADRs + refinements back. Tasks are
    /// refined in place through new versions; the selected option lands on
    /// the project only after a human approval.
    pub async fn run_architect(
        &self,
        task_id: i64,
        engine_name: Option<&str>,
    ) -> Result<ArchitectOutcome> {
        let ctx = self.context().clone();
        ctx.store.get_task(task_id).await?;
        let version = ctx.store.active_version(task_id).await?;

        let engine = self.select_engine(engine_name).await?;
        let engine_id = engine.info().name;
        let (run, cancel) = self
            .start_run(&engine_id, Phase::Architect, Some(task_id))
            .await?;

        let mut context_docs = Vec::new();
        if let Some(spec) = latest_artifact_text(&ctx, ArtifactKind::Spec).await? {
            context_docs.push(format!("## Specification\n{spec}"));
        }
        if let Some(plan) = latest_artifact_text(&ctx, ArtifactKind::Plan).await? {
            context_docs.push(format!("## Plan\n{plan}"));
        }
        for adr in all_artifact_texts(&ctx, ArtifactKind::Adr).await? {
            context_docs.push(format!("## Prior ADR\n{adr}"));
        }

        let prompt = format!(
            "{ARCHITECT_INSTRUCTIONS}\n\n{}",
            render_task_brief(&version)
        );
        let mut session = match engine
            .start(EngineRequest {
                prompt,
                context: context_docs,
                workdir: ctx.root.clone(),
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.finish_run(run.id, RunStatus::Failure, None, Some(&err.to_string()))
                    .await?;
                self.phase_failed(Phase::Architect, run.id, err.code());
                return Err(err);
            }
        };

        let transcript = match self.drain_session(&mut session, run.id, &cancel).await {
            Ok(transcript) => transcript,
            Err(ForemanError::Cancelled) => {
                self.finish_run(run.id, RunStatus::Cancelled, None, None).await?;
                return Err(ForemanError::Cancelled);
            }
            Err(err) => {
                self.finish_run(run.id, RunStatus::Failure, None, Some(&err.to_string()))
                    .await?;
                self.phase_failed(Phase::Architect, run.id, err.code());
                return Err(err);
            }
        };
        let transcript_artifact = self
            .persist_transcript(&transcript, run.id, Some(task_id))
            .await?;

        let architecture = match parse_architecture(&transcript) {
            Ok(architecture) => architecture,
            Err(err) => {
                self.finish_run(run.id, RunStatus::Failure, None, Some("architecture_parse"))
                    .await?;
                self.phase_failed(Phase::Architect, run.id, "architecture_parse");
                return Err(err);
            }
        };

        let mut adr_artifacts = Vec::with_capacity(architecture.adrs.len());
        for adr in &architecture.adrs {
            let meta = self
                .put_artifact(
                    adr.markdown.as_bytes(),
                    ArtifactKind::Adr,
                    Some(run.id),
                    Some(task_id),
                )
                .await?;
            adr_artifacts.push(meta);
        }

        let architecture_artifact = self
            .put_artifact(
                serde_json::to_vec_pretty(&architecture)?.as_slice(),
                ArtifactKind::Architecture,
                Some(run.id),
                Some(task_id),
            )
            .await?;

        // Refinements produce new task versions. Post-approval tasks are
        // skipped; they only change through change requests.
        let mut refined_tasks = Vec::new();
        for refinement in &architecture.task_refinements {
            let target = match ctx.store.get_task(refinement.task_id).await {
                Ok(target) => target,
                Err(_) => {
                    tracing::warn!(
                        task_id = refinement.task_id,
                        "architect refinement targets unknown task"
                    );
                    continue;
                }
            };
            if target.status != TaskStatus::Pending
                && target.status != TaskStatus::AwaitingApproval
            {
                tracing::warn!(
                    task_id = target.id,
                    status = target.status.as_str(),
                    "skipping refinement of non-editable task"
                );
                continue;
            }
            let current = ctx.store.active_version(target.id).await?;
            let spec = TaskSpec {
                title: current.title.clone(),
                description: current.description.clone(),
                priority: refinement.priority.unwrap_or(target.priority),
                acceptance_criteria: current.acceptance_criteria.clone(),
                dependencies: if refinement.deps.is_empty() {
                    current.dependencies.clone()
                } else {
                    refinement.deps.clone()
                },
                gates: if refinement.gates.is_empty() {
                    current.gates.clone()
                } else {
                    refinement.gates.clone()
                },
            };
            let (refined, _) = ctx.governance.update_task(target.id, &spec).await?;
            refined_tasks.push(refined);
        }

        ctx.store
            .update_project(Some(Phase::Review), None, None)
            .await?;
        let run = self.finish_run(run.id, RunStatus::Success, None, None).await?;
        self.phase_completed(Phase::Architect, run.id, "success");

        Ok(ArchitectOutcome {
            run,
            transcript_artifact,
            architecture_artifact,
            adr_artifacts,
            refined_tasks,
        })
    }
}

async fn latest_artifact_text(
    ctx: &foreman_core::ProjectContext,
    kind: ArtifactKind,
) -> Result<Option<String>> {
    let artifacts = ctx.store.list_artifacts(Some(kind)).await?;
    let Some(meta) = artifacts.last() else {
        return Ok(None);
    };
    let bytes = ctx.artifacts.read(meta).await?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

async fn all_artifact_texts(
    ctx: &foreman_core::ProjectContext,
    kind: ArtifactKind,
) -> Result<Vec<String>> {
    let artifacts = ctx.store.list_artifacts(Some(kind)).await?;
    let mut out = Vec::with_capacity(artifacts.len());
    for meta in &artifacts {
        let bytes = ctx.artifacts.read(meta).await?;
        out.push(String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::testutil::fixture_with_engine;
    use foreman_types::{ArtifactKind, RunStatus, TaskSpec, TaskStatus};

    const ARCHITECTURE_OUTPUT: &str = r##"Considered a few designs.
{
  "options": [
    {"id": "opt-modular", "name": "Modular monolith", "description": "one binary",
     "pros": ["simple ops"], "cons": ["coarse scaling"], "trade_offs": "simplicity over elasticity"},
    {"id": "opt-services", "name": "Service split", "description": "two services",
     "pros": ["independent deploys"], "cons": ["more ops"], "trade_offs": "elasticity over simplicity"}
  ],
  "adrs": [
    {"name": "adr-001-storage", "markdown": "# Storage\nEmbedded database per project."}
  ],
  "task_refinements": [
    {"task_id": 1, "deps": [], "priority": 5}
  ]
}"##;

    #[tokio::test]
    async fn architect_persists_adrs_and_refines_the_task() {
        let fixture = fixture_with_engine(ARCHITECTURE_OUTPUT).await;
        let task = fixture
            .ctx
            .governance
            .create_task(
                &TaskSpec {
                    title: "Design storage".into(),
                    ..Default::default()
                },
                foreman_types::Phase::Planner,
            )
            .await
            .unwrap();
        assert_eq!(task.id, 1);

        let outcome = fixture
            .orchestrator
            .run_architect(task.id, None)
            .await
            .unwrap();
        assert_eq!(outcome.run.status, RunStatus::Success);
        assert_eq!(outcome.adr_artifacts.len(), 1);
        assert_eq!(outcome.architecture_artifact.kind, ArtifactKind::Architecture);
        assert_eq!(outcome.refined_tasks.len(), 1);

        // Refinement created version 2 with the new priority.
        let refined = fixture.ctx.store.get_task(task.id).await.unwrap();
        assert_eq!(refined.priority, 5);
        assert_eq!(refined.status, TaskStatus::Pending);
        let versions = fixture.ctx.store.task_versions(task.id).await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn architect_without_structured_output_is_a_parse_failure() {
        let fixture = fixture_with_engine("no structure here").await;
        let task = fixture
            .ctx
            .governance
            .create_task(
                &TaskSpec {
                    title: "Design".into(),
                    ..Default::default()
                },
                foreman_types::Phase::Planner,
            )
            .await
            .unwrap();
        let err = fixture
            .orchestrator
            .run_architect(task.id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "parse");
        let runs = fixture.ctx.store.list_runs(Some(task.id)).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failure);
    }
}
