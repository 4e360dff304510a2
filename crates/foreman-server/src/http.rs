use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::{Any, CorsLayer};

use foreman_core::{EventBus, ProjectConfig};
use foreman_orchestrator::{CoderRunStatus, SpecInput};
use foreman_types::{
    ApprovalDecision, ArtifactKind, ChangeDelta, ChangeKind, ForemanError, TaskSpec, TaskStatus,
};

use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    code: &'static str,
}

/// Typed errors map to a stable code and a short message; the event
/// channel carries the richer payload.
pub(crate) struct ApiError(ForemanError);

impl From<ForemanError> for ApiError {
    fn from(err: ForemanError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ForemanError::NotFound(_) => StatusCode::NOT_FOUND,
            ForemanError::Conflict(_) => StatusCode::CONFLICT,
            ForemanError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ForemanError::Forbidden(_) => StatusCode::FORBIDDEN,
            ForemanError::Preconditions(_) => StatusCode::PRECONDITION_FAILED,
            ForemanError::EngineFailure(_) | ForemanError::Parse(_) => StatusCode::BAD_GATEWAY,
            ForemanError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ForemanError::Cancelled => StatusCode::CONFLICT,
            ForemanError::Storage(_) | ForemanError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let envelope = ErrorEnvelope {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(envelope)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "foreman server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/event", get(global_events))
        .route("/project", post(create_project).get(list_projects))
        .route("/project/{id}", get(get_project).delete(delete_project))
        .route("/project/{id}/event", get(project_events))
        .route(
            "/project/{id}/config",
            get(get_config).put(put_config),
        )
        .route("/project/{id}/engine", get(list_engines).post(switch_engine))
        .route(
            "/project/{id}/architecture/select",
            post(select_architecture),
        )
        .route("/project/{id}/task", post(create_task).get(list_tasks))
        .route(
            "/project/{id}/task/{task_id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/project/{id}/task/{task_id}/version", get(list_versions))
        .route("/project/{id}/task/{task_id}/gates", put(put_gates))
        .route("/project/{id}/task/{task_id}/submit", post(submit_task))
        .route("/project/{id}/task/{task_id}/decide", post(decide_task))
        .route("/project/{id}/task/{task_id}/split", post(split_task))
        .route("/project/{id}/task/{task_id}/merge", post(merge_task))
        .route(
            "/project/{id}/task/{task_id}/change-request",
            post(create_change_request),
        )
        .route(
            "/project/{id}/change-request",
            get(list_change_requests),
        )
        .route(
            "/project/{id}/change-request/{cr_id}",
            get(get_change_request)
                .put(update_change_request)
                .delete(delete_change_request),
        )
        .route(
            "/project/{id}/change-request/{cr_id}/submit",
            post(submit_change_request),
        )
        .route(
            "/project/{id}/change-request/{cr_id}/approve",
            post(approve_change_request),
        )
        .route(
            "/project/{id}/change-request/{cr_id}/reject",
            post(reject_change_request),
        )
        .route(
            "/project/{id}/change-request/{cr_id}/apply",
            post(apply_change_request),
        )
        .route("/project/{id}/artifact", get(list_artifacts))
        .route("/project/{id}/artifact/{artifact_id}", get(get_artifact))
        .route(
            "/project/{id}/artifact/{artifact_id}/download",
            get(download_artifact),
        )
        .route("/project/{id}/run", get(list_runs))
        .route("/project/{id}/run/planner", post(run_planner))
        .route("/project/{id}/run/architect", post(run_architect))
        .route("/project/{id}/run/coder", post(run_coder))
        .route("/project/{id}/run/{run_id}/cancel", post(cancel_run))
        .route("/project/{id}/vcs/status", get(vcs_status))
        .route("/project/{id}/vcs/init", post(vcs_init))
        .route("/project/{id}/vcs/commit", post(vcs_commit))
        .route("/project/{id}/vcs/diff", get(vcs_diff))
        .route("/project/{id}/control", get(get_control))
        .route("/project/{id}/control/pause", post(pause_project))
        .route("/project/{id}/control/continue", post(continue_project))
        .route("/project/{id}/control/limits", post(set_limits))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ---- events ----------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct EventQuery {
    #[serde(default)]
    since: u64,
}

fn event_stream(
    bus: EventBus,
    since: u64,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    let rx = bus.subscribe();
    let replayed = bus.replay_since(since);
    let last_replayed = replayed.last().map(|e| e.seq).unwrap_or(since);
    let initial = tokio_stream::iter(replayed.into_iter().map(|event| {
        Ok(Event::default().data(serde_json::to_string(&event).unwrap_or_default()))
    }));
    let live = BroadcastStream::new(rx).filter_map(move |msg| {
        futures::future::ready(match msg {
            Ok(event) if event.seq > last_replayed => Some(Ok(Event::default()
                .data(serde_json::to_string(&event).unwrap_or_default()))),
            _ => None,
        })
    });
    initial.chain(live)
}

async fn global_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    Sse::new(event_stream(state.registry.global_bus.clone(), query.since))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

async fn project_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventQuery>,
) -> std::result::Result<
    Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>,
    ApiError,
> {
    let ctx = state.context(&id).await?;
    Ok(
        Sse::new(event_stream(ctx.bus.clone(), query.since))
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(10))),
    )
}

// ---- projects --------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateProjectInput {
    name: String,
    root: String,
    default_engine: Option<String>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<CreateProjectInput>,
) -> ApiResult<Value> {
    let project = state
        .registry
        .create_project(
            &input.name,
            &PathBuf::from(&input.root),
            input.default_engine.as_deref(),
        )
        .await?;
    Ok(Json(json!(project)))
}

async fn list_projects(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.registry.list_projects().await))
}

async fn get_project(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let project = ctx.project().await?;
    let tasks = ctx.store.list_tasks(None).await.map_err(ForemanError::from)?;
    let by_status = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
    Ok(Json(json!({
        "project": project,
        "tasks": {
            "total": tasks.len(),
            "pending": by_status(TaskStatus::Pending),
            "awaiting_approval": by_status(TaskStatus::AwaitingApproval),
            "approved": by_status(TaskStatus::Approved),
            "in_progress": by_status(TaskStatus::InProgress),
            "completed": by_status(TaskStatus::Completed),
            "rejected": by_status(TaskStatus::Rejected),
            "cancelled": by_status(TaskStatus::Cancelled),
        }
    })))
}

async fn delete_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    state.registry.delete_project(&id).await?;
    state.forget_project(&id).await;
    Ok(Json(json!({"deleted": id})))
}

// ---- config & engines ------------------------------------------------------

async fn get_config(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    Ok(Json(json!(ctx.config().await)))
}

async fn put_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ProjectConfig>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let applied = ctx.update_config(config).await?;
    Ok(Json(json!(applied)))
}

async fn list_engines(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    Ok(Json(json!(ctx.engines.list().await)))
}

#[derive(Debug, Deserialize)]
struct EngineInput {
    engine: String,
}

async fn switch_engine(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<EngineInput>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    orchestrator.switch_engine(&input.engine).await?;
    Ok(Json(json!({"engine": input.engine})))
}

#[derive(Debug, Deserialize)]
struct SelectOptionInput {
    option_id: String,
}

async fn select_architecture(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<SelectOptionInput>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    orchestrator
        .select_architecture_option(&input.option_id)
        .await?;
    Ok(Json(json!({"selected": input.option_id})))
}

// ---- tasks -----------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct TaskListQuery {
    status: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let project = ctx.project().await?;
    let task = ctx.governance.create_task(&spec, project.current_phase).await?;
    Ok(Json(json!(task)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TaskListQuery>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let status = match query.status.as_deref() {
        Some(raw) => Some(TaskStatus::parse(raw).ok_or_else(|| {
            ForemanError::Validation(format!("unknown task status `{raw}`"))
        })?),
        None => None,
    };
    let tasks = ctx.store.list_tasks(status).await.map_err(ForemanError::from)?;
    Ok(Json(json!(tasks)))
}

async fn get_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let task = ctx.store.get_task(task_id).await.map_err(ForemanError::from)?;
    let version = ctx
        .store
        .active_version(task_id)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!({"task": task, "active_version": version})))
}

async fn update_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
    Json(spec): Json<TaskSpec>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let (task, version) = ctx.governance.update_task(task_id, &spec).await?;
    Ok(Json(json!({"task": task, "version": version})))
}

async fn delete_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    ctx.governance.delete_task(task_id).await?;
    Ok(Json(json!({"deleted": task_id})))
}

async fn list_versions(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let versions = ctx
        .store
        .task_versions(task_id)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(versions)))
}

#[derive(Debug, Deserialize)]
struct GatesInput {
    gates: Vec<foreman_types::GateSpec>,
}

async fn put_gates(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
    Json(input): Json<GatesInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let current = ctx
        .store
        .active_version(task_id)
        .await
        .map_err(ForemanError::from)?;
    let task = ctx.store.get_task(task_id).await.map_err(ForemanError::from)?;
    let spec = TaskSpec {
        title: current.title.clone(),
        description: current.description.clone(),
        priority: task.priority,
        acceptance_criteria: current.acceptance_criteria.clone(),
        dependencies: current.dependencies.clone(),
        gates: input.gates,
    };
    let (task, version) = ctx.governance.update_task(task_id, &spec).await?;
    Ok(Json(json!({"task": task, "version": version})))
}

async fn submit_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let task = ctx.governance.submit_for_approval(task_id).await?;
    Ok(Json(json!(task)))
}

#[derive(Debug, Deserialize)]
struct DecisionInput {
    approver: String,
    decision: ApprovalDecision,
    notes: Option<String>,
}

async fn decide_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
    Json(input): Json<DecisionInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let (task, approval) = ctx
        .governance
        .decide_task(
            task_id,
            &input.approver,
            input.decision,
            input.notes.as_deref(),
        )
        .await?;
    Ok(Json(json!({"task": task, "approval": approval})))
}

async fn split_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let outcome = ctx.governance.split(task_id).await?;
    Ok(Json(apply_outcome_json(outcome)))
}

async fn merge_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let outcome = ctx.governance.merge(task_id).await?;
    Ok(Json(apply_outcome_json(outcome)))
}

fn apply_outcome_json(outcome: foreman_core::ApplyOutcome) -> Value {
    match outcome {
        foreman_core::ApplyOutcome::Edited { task, version } => {
            json!({"kind": "edited", "task": task, "version": version})
        }
        foreman_core::ApplyOutcome::Split { tasks, source } => {
            json!({"kind": "split", "tasks": tasks, "source": source})
        }
        foreman_core::ApplyOutcome::Merged { task } => {
            json!({"kind": "merged", "task": task})
        }
    }
}

// ---- change requests -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChangeRequestInput {
    kind: ChangeKind,
    #[serde(default)]
    delta: ChangeDelta,
}

async fn create_change_request(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, i64)>,
    Json(input): Json<ChangeRequestInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let cr = ctx
        .governance
        .create_change_request(task_id, input.kind, &input.delta)
        .await?;
    Ok(Json(json!(cr)))
}

#[derive(Debug, Deserialize, Default)]
struct ChangeRequestQuery {
    task_id: Option<i64>,
}

async fn list_change_requests(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChangeRequestQuery>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let requests = ctx
        .store
        .list_change_requests(query.task_id)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(requests)))
}

async fn get_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let cr = ctx
        .store
        .get_change_request(cr_id)
        .await
        .map_err(ForemanError::from)?;
    let approvals = ctx
        .store
        .list_approvals(Some(cr_id))
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!({"change_request": cr, "approvals": approvals})))
}

#[derive(Debug, Deserialize)]
struct DeltaInput {
    delta: ChangeDelta,
}

async fn update_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
    Json(input): Json<DeltaInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let cr = ctx
        .governance
        .update_change_request(cr_id, &input.delta)
        .await?;
    Ok(Json(json!(cr)))
}

async fn delete_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    ctx.governance.delete_change_request(cr_id).await?;
    Ok(Json(json!({"deleted": cr_id})))
}

async fn submit_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let cr = ctx.governance.submit_change_request(cr_id).await?;
    Ok(Json(json!(cr)))
}

#[derive(Debug, Deserialize)]
struct CrDecisionInput {
    approver: String,
    notes: Option<String>,
}

async fn approve_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
    Json(input): Json<CrDecisionInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let (cr, approval) = ctx
        .governance
        .approve_change_request(cr_id, &input.approver, input.notes.as_deref())
        .await?;
    Ok(Json(json!({"change_request": cr, "approval": approval})))
}

async fn reject_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
    Json(input): Json<CrDecisionInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let (cr, approval) = ctx
        .governance
        .reject_change_request(cr_id, &input.approver, input.notes.as_deref())
        .await?;
    Ok(Json(json!({"change_request": cr, "approval": approval})))
}

async fn apply_change_request(
    State(state): State<AppState>,
    Path((id, cr_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let outcome = ctx.governance.apply_change_request(cr_id).await?;
    Ok(Json(apply_outcome_json(outcome)))
}

// ---- artifacts -------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct ArtifactQuery {
    kind: Option<String>,
}

async fn list_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let kind = match query.kind.as_deref() {
        Some(raw) => Some(ArtifactKind::parse(raw).ok_or_else(|| {
            ForemanError::Validation(format!("unknown artifact kind `{raw}`"))
        })?),
        None => None,
    };
    let artifacts = ctx
        .store
        .list_artifacts(kind)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(artifacts)))
}

async fn get_artifact(
    State(state): State<AppState>,
    Path((id, artifact_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let meta = ctx
        .store
        .get_artifact(artifact_id)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(meta)))
}

async fn download_artifact(
    State(state): State<AppState>,
    Path((id, artifact_id)): Path<(String, i64)>,
) -> std::result::Result<Response, ApiError> {
    let ctx = state.context(&id).await?;
    let meta = ctx
        .store
        .get_artifact(artifact_id)
        .await
        .map_err(ForemanError::from)?;
    let bytes = ctx.artifacts.read(&meta).await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// ---- runs ------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct RunListQuery {
    task_id: Option<i64>,
}

async fn list_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RunListQuery>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let runs = ctx
        .store
        .list_runs(query.task_id)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(runs)))
}

#[derive(Debug, Deserialize)]
struct PlannerInput {
    spec_body: Option<String>,
    spec_artifact_id: Option<i64>,
    engine: Option<String>,
}

async fn run_planner(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<PlannerInput>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    let spec = match (input.spec_body, input.spec_artifact_id) {
        (Some(body), _) => SpecInput::Body(body),
        (None, Some(artifact_id)) => SpecInput::Artifact(artifact_id),
        (None, None) => {
            return Err(ForemanError::Validation(
                "either spec_body or spec_artifact_id is required".into(),
            )
            .into())
        }
    };
    let outcome = orchestrator
        .run_planner(spec, input.engine.as_deref())
        .await?;
    Ok(Json(json!({
        "run": outcome.run,
        "spec_artifact": outcome.spec_artifact,
        "transcript_artifact": outcome.transcript_artifact,
        "plan_artifact": outcome.plan_artifact,
        "tasks": outcome.tasks,
    })))
}

#[derive(Debug, Deserialize)]
struct ArchitectInput {
    task_id: i64,
    engine: Option<String>,
}

async fn run_architect(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ArchitectInput>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    let outcome = orchestrator
        .run_architect(input.task_id, input.engine.as_deref())
        .await?;
    Ok(Json(json!({
        "run": outcome.run,
        "transcript_artifact": outcome.transcript_artifact,
        "architecture_artifact": outcome.architecture_artifact,
        "adr_artifacts": outcome.adr_artifacts,
        "refined_tasks": outcome.refined_tasks,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct CoderInput {
    task_id: Option<i64>,
    engine: Option<String>,
}

fn coder_status_str(status: CoderRunStatus) -> &'static str {
    match status {
        CoderRunStatus::Committed => "committed",
        CoderRunStatus::GatesFailed => "gates_failed",
        CoderRunStatus::Exhausted => "exhausted",
        CoderRunStatus::Cancelled => "cancelled",
    }
}

async fn run_coder(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<CoderInput>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    match input.task_id {
        Some(task_id) => {
            let outcome = orchestrator
                .run_coder(task_id, input.engine.as_deref())
                .await?;
            Ok(Json(json!({
                "run": outcome.run,
                "task": outcome.task,
                "status": coder_status_str(outcome.status),
                "gate_report": outcome.gate_report,
                "commit_sha": outcome.commit_sha,
            })))
        }
        None => {
            let report = orchestrator.run_coder_loop(input.engine.as_deref()).await?;
            let outcomes: Vec<Value> = report
                .outcomes
                .iter()
                .map(|outcome| {
                    json!({
                        "run_id": outcome.run.id,
                        "task_id": outcome.task.id,
                        "status": coder_status_str(outcome.status),
                        "commit_sha": outcome.commit_sha,
                    })
                })
                .collect();
            let stopped = match report.stopped {
                foreman_orchestrator::LoopStop::Paused => "paused",
                foreman_orchestrator::LoopStop::NoReady => "no_ready",
            };
            Ok(Json(json!({"outcomes": outcomes, "stopped": stopped})))
        }
    }
}

async fn cancel_run(
    State(state): State<AppState>,
    Path((id, run_id)): Path<(String, i64)>,
) -> ApiResult<Value> {
    let orchestrator = state.orchestrator(&id).await?;
    let cancelled = orchestrator.cancel_run(run_id).await;
    if !cancelled {
        return Err(ForemanError::NotFound(format!("run {run_id} is not live")).into());
    }
    Ok(Json(json!({"cancelled": run_id})))
}

// ---- vcs -------------------------------------------------------------------

async fn vcs_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let vcs = ctx.vcs().await;
    let is_repo = vcs.is_repo(&ctx.root).await?;
    if !is_repo {
        return Ok(Json(json!({"is_repo": false})));
    }
    let status = vcs.status(&ctx.root).await?;
    Ok(Json(json!({
        "is_repo": true,
        "branch": status.branch,
        "staged": status.staged,
        "unstaged": status.unstaged,
        "has_changes": status.has_changes,
    })))
}

async fn vcs_init(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    ctx.vcs().await.init(&ctx.root).await?;
    Ok(Json(json!({"initialized": true})))
}

#[derive(Debug, Deserialize)]
struct CommitInput {
    files: Vec<String>,
    message: String,
}

async fn vcs_commit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<CommitInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let files: Vec<PathBuf> = input.files.iter().map(PathBuf::from).collect();
    let sha = ctx
        .vcs()
        .await
        .commit(&ctx.root, &files, &input.message)
        .await?;
    Ok(Json(json!({"sha": sha})))
}

async fn vcs_diff(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let diff = ctx.vcs().await.diff(&ctx.root).await?;
    Ok(Json(json!({"diff": diff})))
}

// ---- control ---------------------------------------------------------------

async fn get_control(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let control = ctx.store.control_state().await.map_err(ForemanError::from)?;
    Ok(Json(json!(control)))
}

async fn pause_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let control = ctx.store.set_paused(true).await.map_err(ForemanError::from)?;
    ctx.bus.publish(foreman_types::WorkflowEvent::new(
        foreman_types::EventKind::ProjectUpdated,
        ctx.project_id.clone(),
        json!({"paused": true}),
    ));
    Ok(Json(json!(control)))
}

async fn continue_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let control = ctx
        .store
        .set_paused(false)
        .await
        .map_err(ForemanError::from)?;
    ctx.bus.publish(foreman_types::WorkflowEvent::new(
        foreman_types::EventKind::ProjectUpdated,
        ctx.project_id.clone(),
        json!({"paused": false}),
    ));
    Ok(Json(json!(control)))
}

#[derive(Debug, Deserialize)]
struct LimitsInput {
    max_attempts: i64,
}

async fn set_limits(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<LimitsInput>,
) -> ApiResult<Value> {
    let ctx = state.context(&id).await?;
    let control = ctx
        .store
        .set_max_attempts(input.max_attempts)
        .await
        .map_err(ForemanError::from)?;
    Ok(Json(json!(control)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AppState;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use foreman_core::ProjectRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn test_state() -> (TempDir, TempDir, AppState) {
        let state_dir = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let registry = ProjectRegistry::load(state_dir.path()).await.unwrap();
        (state_dir, work, AppState::new(Arc::new(registry)))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (_s, _w, state) = test_state().await;
        let app = app_router(state);
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn project_and_task_crud_over_http() {
        let (_s, work, state) = test_state().await;
        let app = app_router(state);

        let root = work.path().join("demo");
        let response = app
            .clone()
            .oneshot(post_json(
                "/project",
                json!({"name": "demo", "root": root.display().to_string()}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let project = body_json(response).await;
        let project_id = project["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/project/{project_id}/task"),
                json!({"title": "Add login", "description": "login flow"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task = body_json(response).await;
        assert_eq!(task["status"], "PENDING");
        let task_id = task["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/project/{project_id}/task/{task_id}/version"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let versions = body_json(response).await;
        assert_eq!(versions.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn typed_errors_map_to_stable_codes() {
        let (_s, _w, state) = test_state().await;
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::get("/project/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn coder_on_unapproved_task_is_precondition_failed() {
        let (_s, work, state) = test_state().await;
        let app = app_router(state);

        let root = work.path().join("demo");
        let project = body_json(
            app.clone()
                .oneshot(post_json(
                    "/project",
                    json!({"name": "demo", "root": root.display().to_string()}),
                ))
                .await
                .unwrap(),
        )
        .await;
        let project_id = project["id"].as_str().unwrap().to_string();

        let task = body_json(
            app.clone()
                .oneshot(post_json(
                    &format!("/project/{project_id}/task"),
                    json!({"title": "T"}),
                ))
                .await
                .unwrap(),
        )
        .await;
        let task_id = task["id"].as_i64().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/project/{project_id}/run/coder"),
                json!({"task_id": task_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "preconditions");
    }

    #[tokio::test]
    async fn control_pause_and_limits_round_trip() {
        let (_s, work, state) = test_state().await;
        let app = app_router(state);
        let root = work.path().join("demo");
        let project = body_json(
            app.clone()
                .oneshot(post_json(
                    "/project",
                    json!({"name": "demo", "root": root.display().to_string()}),
                ))
                .await
                .unwrap(),
        )
        .await;
        let project_id = project["id"].as_str().unwrap().to_string();

        let control = body_json(
            app.clone()
                .oneshot(post_json(
                    &format!("/project/{project_id}/control/pause"),
                    json!({}),
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(control["paused"], true);

        let control = body_json(
            app.clone()
                .oneshot(post_json(
                    &format!("/project/{project_id}/control/limits"),
                    json!({"max_attempts": 5}),
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(control["max_attempts"], 5);
    }
}
