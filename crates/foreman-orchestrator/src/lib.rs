mod architect;
mod coder;
mod context;
mod parse;
mod planner;
#[cfg(test)]
pub(crate) mod testutil;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use foreman_core::ProjectContext;
use foreman_engines::{Engine, EngineChunk, EngineSession};
use foreman_types::{
    ArtifactKind, EventKind, ForemanError, Phase, Result, Run, RunStatus, WorkflowEvent,
};

pub use architect::ArchitectOutcome;
pub use coder::{CoderLoopReport, CoderOutcome, CoderRunStatus, LoopStop};
pub use parse::{
    parse_architecture, parse_engine_output, parse_plan, AdrDocument, ArchitectureOption,
    ArchitecturePayload, ParsedEngineOutput, PlanMetadata, PlanPayload, PlanTask, TaskRefinement,
};
pub use planner::PlannerOutcome;

/// Spec input for the planner: fresh text or an existing artifact.
#[derive(Debug, Clone)]
pub enum SpecInput {
    Body(String),
    Artifact(i64),
}

/// Drives the Planner, Architect, and Coder phases for one project. Each
/// phase executes as a discrete, resumable run with its own `Run` row and
/// cancellation handle.
#[derive(Clone)]
pub struct PhaseOrchestrator {
    ctx: Arc<ProjectContext>,
    cancellations: Arc<tokio::sync::RwLock<HashMap<i64, CancellationToken>>>,
}

impl PhaseOrchestrator {
    pub fn new(ctx: Arc<ProjectContext>) -> Self {
        Self {
            ctx,
            cancellations: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &Arc<ProjectContext> {
        &self.ctx
    }

    /// Cancel a live run. The phase ends with status `CANCELLED` and no
    /// partial commits.
    pub async fn cancel_run(&self, run_id: i64) -> bool {
        let cancellations = self.cancellations.read().await;
        match cancellations.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Switch the project's default engine. A live coder run is aborted
    /// cleanly; the coder loop restarts the task with the new engine.
    pub async fn switch_engine(&self, engine: &str) -> Result<()> {
        self.ctx
            .engines
            .select(Some(engine))
            .await
            .map_err(|_| ForemanError::NotFound(format!("engine `{engine}` is not configured")))?;
        self.ctx
            .store
            .update_project(None, Some(engine), None)
            .await?;
        let cancellations = self.cancellations.read().await;
        for token in cancellations.values() {
            token.cancel();
        }
        Ok(())
    }

    /// Record the chosen architecture option on the project. Only called
    /// after a human approval decision.
    pub async fn select_architecture_option(&self, option_id: &str) -> Result<()> {
        self.ctx
            .store
            .update_project(None, None, Some(Some(option_id)))
            .await?;
        self.publish(
            EventKind::ProjectUpdated,
            json!({"selectedArchitectureOption": option_id}),
        );
        Ok(())
    }

    pub(crate) fn publish(&self, kind: EventKind, payload: serde_json::Value) {
        self.ctx.bus.publish(WorkflowEvent::new(
            kind,
            self.ctx.project_id.clone(),
            payload,
        ));
    }

    pub(crate) async fn select_engine(
        &self,
        explicit: Option<&str>,
    ) -> Result<Arc<dyn Engine>> {
        if let Some(name) = explicit {
            return self.ctx.engines.select(Some(name)).await;
        }
        let project = self.ctx.project().await?;
        if !project.default_engine.is_empty() {
            if let Ok(engine) = self
                .ctx
                .engines
                .select(Some(project.default_engine.as_str()))
                .await
            {
                return Ok(engine);
            }
        }
        self.ctx.engines.select(None).await
    }

    pub(crate) async fn start_run(
        &self,
        engine: &str,
        phase: Phase,
        task_id: Option<i64>,
    ) -> Result<(Run, CancellationToken)> {
        let run = self.ctx.store.create_run(engine, phase, task_id).await?;
        let token = CancellationToken::new();
        self.cancellations.write().await.insert(run.id, token.clone());
        self.publish(
            EventKind::RunStarted,
            json!({"runId": run.id, "phase": phase, "engine": engine, "taskId": task_id}),
        );
        self.publish(
            EventKind::PhaseStarted,
            json!({"phase": phase, "runId": run.id, "taskId": task_id}),
        );
        Ok((run, token))
    }

    pub(crate) async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        gate_report: Option<&foreman_types::GateReport>,
        error: Option<&str>,
    ) -> Result<Run> {
        self.cancellations.write().await.remove(&run_id);
        let run = self
            .ctx
            .store
            .finish_run(run_id, status, gate_report, error)
            .await?;
        self.publish(
            EventKind::RunEnded,
            json!({"runId": run.id, "status": status, "error": error}),
        );
        Ok(run)
    }

    pub(crate) fn phase_completed(&self, phase: Phase, run_id: i64, status: &str) {
        self.publish(
            EventKind::PhaseCompleted,
            json!({"phase": phase, "runId": run_id, "status": status}),
        );
    }

    pub(crate) fn phase_failed(&self, phase: Phase, run_id: i64, reason: &str) {
        self.publish(
            EventKind::PhaseFailed,
            json!({"phase": phase, "runId": run_id, "reason": reason}),
        );
    }

    /// Stream the session to completion, persisting nothing yet; emits
    /// incremental `run_log` events and returns the full transcript.
    pub(crate) async fn drain_session(
        &self,
        session: &mut EngineSession,
        run_id: i64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // Propagate run cancellation into the engine session so the stream
        // completes within the adapter's grace period.
        let link = {
            let cancel = cancel.clone();
            let session_token = session.cancel_token();
            tokio::spawn(async move {
                cancel.cancelled().await;
                session_token.cancel();
            })
        };

        let mut transcript = String::new();
        let mut result = Ok(());
        loop {
            let Some(chunk) = session.next_chunk().await else {
                break;
            };
            match chunk {
                Ok(EngineChunk::Text(text)) => {
                    self.publish(EventKind::RunLog, json!({"runId": run_id, "chunk": text}));
                    transcript.push_str(&text);
                }
                Ok(EngineChunk::Log(line)) => {
                    tracing::debug!(run_id, line = %line, "engine diagnostic");
                }
                Ok(EngineChunk::Done { reason }) => {
                    if reason == "cancelled" {
                        result = Err(ForemanError::Cancelled);
                    }
                    break;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        link.abort();
        result?;
        if cancel.is_cancelled() {
            return Err(ForemanError::Cancelled);
        }
        Ok(transcript)
    }

    pub(crate) async fn persist_transcript(
        &self,
        transcript: &str,
        run_id: i64,
        task_id: Option<i64>,
    ) -> Result<foreman_types::ArtifactMeta> {
        self.ctx
            .artifacts
            .put(
                &self.ctx.store,
                transcript.as_bytes(),
                ArtifactKind::Transcript,
                Some(run_id),
                task_id,
            )
            .await
            .map(|meta| {
                self.publish(
                    EventKind::ArtifactCreated,
                    json!({"artifactId": meta.id, "kind": meta.kind, "runId": run_id}),
                );
                meta
            })
    }

    pub(crate) async fn put_artifact(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        run_id: Option<i64>,
        task_id: Option<i64>,
    ) -> Result<foreman_types::ArtifactMeta> {
        let meta = self
            .ctx
            .artifacts
            .put(&self.ctx.store, bytes, kind, run_id, task_id)
            .await?;
        self.publish(
            EventKind::ArtifactCreated,
            json!({"artifactId": meta.id, "kind": meta.kind, "runId": run_id, "taskId": task_id}),
        );
        Ok(meta)
    }
}
