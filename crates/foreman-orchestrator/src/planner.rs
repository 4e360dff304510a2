use chrono::Utc;
use serde_json::json;

use foreman_engines::EngineRequest;
use foreman_types::{
    ArtifactKind, ArtifactMeta, EventKind, ForemanError, Phase, Result, Run, RunStatus, Task,
    TaskSpec,
};

use crate::context::PLANNER_INSTRUCTIONS;
use crate::parse::parse_plan;
use crate::{PhaseOrchestrator, SpecInput};

#[derive(Debug)]
pub struct PlannerOutcome {
    pub run: Run,
    pub spec_artifact: ArtifactMeta,
    pub transcript_artifact: ArtifactMeta,
    pub plan_artifact: ArtifactMeta,
    pub tasks: Vec<Task>,
}

impl PhaseOrchestrator {
    /// Planner phase: spec in, tasks out. The transcript and the parsed
    /// plan are persisted as artifacts; every planned task starts in
    /// `PENDING` with version 1.
    pub async fn run_planner(
        &self,
        spec: SpecInput,
        engine_name: Option<&str>,
    ) -> Result<PlannerOutcome> {
        let ctx = self.context().clone();

        let spec_artifact = match spec {
            SpecInput::Body(body) => {
                self.put_artifact(body.as_bytes(), ArtifactKind::Spec, None, None)
                    .await?
            }
            SpecInput::Artifact(id) => ctx.store.get_artifact(id).await?,
        };
        let spec_body = String::from_utf8_lossy(&ctx.artifacts.read(&spec_artifact).await?)
            .into_owned();

        let engine = self.select_engine(engine_name).await?;
        let engine_id = engine.info().name;
        let (run, cancel) = self.start_run(&engine_id, Phase::Planner, None).await?;

        let prompt = format!("{PLANNER_INSTRUCTIONS}\n\n## Specification\n{spec_body}");
        let mut session = match engine
            .start(EngineRequest {
                prompt,
                context: Vec::new(),
                workdir: ctx.root.clone(),
            })
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.finish_run(run.id, RunStatus::Failure, None, Some(&err.to_string()))
                    .await?;
                self.phase_failed(Phase::Planner, run.id, err.code());
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
                self.phase_failed(Phase::Planner, run.id, err.code());
                return Err(err);
            }
        };

        let transcript_artifact = self
            .persist_transcript(&transcript, run.id, None)
            .await?;

        let mut plan = match parse_plan(&transcript) {
            Ok(plan) => plan,
            Err(err) => {
                self.finish_run(run.id, RunStatus::Failure, None, Some("plan_parse"))
                    .await?;
                self.phase_failed(Phase::Planner, run.id, "plan_parse");
                return Err(err);
            }
        };
        if plan.metadata.generated_at.is_none() {
            plan.metadata.generated_at = Some(Utc::now().to_rfc3339());
        }
        if plan.metadata.engine.is_none() {
            plan.metadata.engine = Some(engine_id.clone());
        }

        // Dependencies arrive as indices into the plan; only references to
        // already-created entries resolve to task ids, the rest are dropped.
        let mut tasks: Vec<Task> = Vec::with_capacity(plan.tasks.len());
        for entry in &plan.tasks {
            let dependencies = entry
                .dependencies
                .iter()
                .filter_map(|&index| tasks.get(index).map(|task: &Task| task.id))
                .collect();
            let spec = TaskSpec {
                title: entry.title.clone(),
                description: entry.description.clone(),
                priority: entry.priority.unwrap_or(0),
                acceptance_criteria: entry.acceptance_criteria.clone(),
                dependencies,
                gates: Vec::new(),
            };
            let task = ctx.governance.create_task(&spec, Phase::Planner).await?;
            tasks.push(task);
        }

        let plan_artifact = self
            .put_artifact(
                serde_json::to_vec_pretty(&plan)?.as_slice(),
                ArtifactKind::Plan,
                Some(run.id),
                None,
            )
            .await?;

        ctx.store
            .update_project(Some(Phase::Architect), None, None)
            .await?;
        let run = self.finish_run(run.id, RunStatus::Success, None, None).await?;
        self.phase_completed(Phase::Planner, run.id, "success");
        self.publish(
            EventKind::ProjectUpdated,
            json!({"currentPhase": Phase::Architect}),
        );

        Ok(PlannerOutcome {
            run,
            spec_artifact,
            transcript_artifact,
            plan_artifact,
            tasks,
        })
    }
}
