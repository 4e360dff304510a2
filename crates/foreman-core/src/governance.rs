use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use foreman_store::ProjectStore;
use foreman_types::{
    Approval, ApprovalDecision, ChangeDelta, ChangeKind, ChangeRequest, ChangeRequestStatus,
    EventKind, ForemanError, Phase, Result, Task, TaskSpec, TaskStatus, TaskVersion,
    WorkflowEvent,
};

use crate::event_bus::EventBus;

/// Outcome of applying an approved change request.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Edited {
        task: Task,
        version: TaskVersion,
    },
    Split {
        tasks: Vec<Task>,
        source: Task,
    },
    Merged {
        task: Task,
    },
}

/// Enforces the task/version/change-request/approval state machine.
/// Concurrent edits of one task are linearized by a per-task mutex held in
/// an evictable map; the map never grows beyond the set of tasks currently
/// being mutated.
#[derive(Clone)]
pub struct Governance {
    project_id: String,
    store: Arc<ProjectStore>,
    bus: EventBus,
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl Governance {
    pub fn new(project_id: impl Into<String>, store: Arc<ProjectStore>, bus: EventBus) -> Self {
        Self {
            project_id: project_id.into(),
            store,
            bus,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn task_lock(&self, task_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_task_lock(&self, task_id: i64) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&task_id) {
            // Two strong refs mean map + our clone: nobody else is waiting.
            if Arc::strong_count(lock) <= 2 {
                locks.remove(&task_id);
            }
        }
    }

    fn publish(&self, kind: EventKind, payload: serde_json::Value) -> WorkflowEvent {
        self.bus
            .publish(WorkflowEvent::new(kind, self.project_id.clone(), payload))
    }

    fn publish_for_task(
        &self,
        kind: EventKind,
        task_id: i64,
        version: Option<i64>,
        payload: serde_json::Value,
    ) {
        let event = WorkflowEvent::new(kind, self.project_id.clone(), payload)
            .with_entity(format!("task:{task_id}"), version);
        self.bus.publish(event);
    }

    // ---- tasks ------------------------------------------------------------

    pub async fn create_task(&self, spec: &TaskSpec, phase: Phase) -> Result<Task> {
        if spec.title.trim().is_empty() {
            return Err(ForemanError::Validation("task title must not be empty".into()));
        }
        for dep in &spec.dependencies {
            self.store.get_task(*dep).await.map_err(|_| {
                ForemanError::Validation(format!("dependency task {dep} does not exist"))
            })?;
        }
        let task = self.store.create_task(spec, phase).await?;
        self.publish_for_task(
            EventKind::TaskCreated,
            task.id,
            Some(1),
            json!({"taskId": task.id, "title": task.title, "status": task.status}),
        );
        self.publish_for_task(
            EventKind::TaskVersionCreated,
            task.id,
            Some(1),
            json!({"taskId": task.id, "version": 1}),
        );
        Ok(task)
    }

    /// Mutating edit: new gapless version, `active_version_id` moves.
    /// Post-approval tasks only accept it when an `APPROVED` change request
    /// targets them; terminal tasks never do.
    pub async fn update_task(&self, task_id: i64, spec: &TaskSpec) -> Result<(Task, TaskVersion)> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.lock().await;
        let result = self.update_task_locked(task_id, spec).await;
        drop(guard);
        self.release_task_lock(task_id).await;
        result
    }

    async fn update_task_locked(
        &self,
        task_id: i64,
        spec: &TaskSpec,
    ) -> Result<(Task, TaskVersion)> {
        let task = self.store.get_task(task_id).await?;
        if matches!(task.status, TaskStatus::Cancelled) {
            return Err(ForemanError::Preconditions(format!(
                "task {task_id} is cancelled"
            )));
        }
        if task.status.is_post_approval() && !self.store.has_approved_change_request(task_id).await?
        {
            return Err(ForemanError::Preconditions(format!(
                "task {task_id} is {}; edits must flow through an approved change request",
                task.status.as_str()
            )));
        }
        let (task, version) = self.store.revise_task(task_id, spec, task.phase).await?;
        self.publish_for_task(
            EventKind::TaskVersionCreated,
            task.id,
            Some(version.version),
            json!({"taskId": task.id, "version": version.version}),
        );
        self.publish_for_task(
            EventKind::TaskUpdated,
            task.id,
            Some(version.version),
            json!({"taskId": task.id, "title": task.title}),
        );
        Ok((task, version))
    }

    pub async fn delete_task(&self, task_id: i64) -> Result<()> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.lock().await;
        let result = self.store.delete_task(task_id).await.map_err(Into::into);
        drop(guard);
        self.release_task_lock(task_id).await;
        if result.is_ok() {
            self.publish_for_task(
                EventKind::TaskDeleted,
                task_id,
                None,
                json!({"taskId": task_id}),
            );
        }
        result
    }

    pub async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<Task> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.lock().await;
        let result = self.set_task_status_locked(task_id, status).await;
        drop(guard);
        self.release_task_lock(task_id).await;
        result
    }

    async fn set_task_status_locked(&self, task_id: i64, status: TaskStatus) -> Result<Task> {
        let current = self.store.get_task(task_id).await?;
        if !transition_allowed(current.status, status) {
            return Err(ForemanError::Validation(format!(
                "illegal status transition {} -> {} for task {task_id}",
                current.status.as_str(),
                status.as_str()
            )));
        }
        let task = self.store.set_task_status(task_id, status).await?;
        self.publish_for_task(
            EventKind::TaskStatusChanged,
            task.id,
            None,
            json!({"taskId": task.id, "from": current.status, "to": status}),
        );
        Ok(task)
    }

    /// Review phase entry: hand the task to the human approver.
    pub async fn submit_for_approval(&self, task_id: i64) -> Result<Task> {
        self.set_task_status(task_id, TaskStatus::AwaitingApproval)
            .await
    }

    /// Human decision on the task's active version.
    pub async fn decide_task(
        &self,
        task_id: i64,
        approver: &str,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> Result<(Task, Approval)> {
        let lock = self.task_lock(task_id).await;
        let guard = lock.lock().await;
        let result = self
            .store
            .decide_task_version(task_id, approver, decision, notes)
            .await
            .map_err(ForemanError::from);
        drop(guard);
        self.release_task_lock(task_id).await;
        let (task, approval) = result?;
        self.publish(
            EventKind::ApprovalRecorded,
            json!({
                "approvalId": approval.id,
                "taskVersionId": approval.task_version_id,
                "approver": approval.approver,
                "decision": approval.decision,
            }),
        );
        self.publish_for_task(
            EventKind::TaskStatusChanged,
            task.id,
            None,
            json!({"taskId": task.id, "to": task.status}),
        );
        Ok((task, approval))
    }

    // ---- change requests --------------------------------------------------

    pub async fn create_change_request(
        &self,
        task_id: i64,
        kind: ChangeKind,
        delta: &ChangeDelta,
    ) -> Result<ChangeRequest> {
        match kind {
            ChangeKind::Split if delta.split_specs.len() < 2 => {
                return Err(ForemanError::Validation(
                    "a split request needs at least two child specs".into(),
                ));
            }
            ChangeKind::Merge if delta.merged_spec.is_none() => {
                return Err(ForemanError::Validation(
                    "a merge request needs a merged task spec".into(),
                ));
            }
            _ => {}
        }
        let cr = self.store.create_change_request(task_id, kind, delta).await?;
        self.publish(
            EventKind::ChangeRequestCreated,
            json!({"changeRequestId": cr.id, "taskId": task_id, "kind": kind}),
        );
        Ok(cr)
    }

    pub async fn update_change_request(
        &self,
        cr_id: i64,
        delta: &ChangeDelta,
    ) -> Result<ChangeRequest> {
        let cr = self.store.update_change_request_delta(cr_id, delta).await?;
        self.publish(
            EventKind::ChangeRequestCreated,
            json!({"changeRequestId": cr.id, "taskId": cr.task_id, "updated": true}),
        );
        Ok(cr)
    }

    pub async fn delete_change_request(&self, cr_id: i64) -> Result<()> {
        self.store.delete_change_request(cr_id).await?;
        Ok(())
    }

    pub async fn submit_change_request(&self, cr_id: i64) -> Result<ChangeRequest> {
        let cr = self.store.submit_change_request(cr_id).await?;
        self.publish(
            EventKind::ChangeRequestSubmitted,
            json!({"changeRequestId": cr.id, "taskId": cr.task_id}),
        );
        Ok(cr)
    }

    pub async fn approve_change_request(
        &self,
        cr_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<(ChangeRequest, Approval)> {
        self.decide_change_request(cr_id, approver, ApprovalDecision::Approve, notes)
            .await
    }

    pub async fn reject_change_request(
        &self,
        cr_id: i64,
        approver: &str,
        notes: Option<&str>,
    ) -> Result<(ChangeRequest, Approval)> {
        self.decide_change_request(cr_id, approver, ApprovalDecision::Reject, notes)
            .await
    }

    async fn decide_change_request(
        &self,
        cr_id: i64,
        approver: &str,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> Result<(ChangeRequest, Approval)> {
        let (cr, approval) = self
            .store
            .decide_change_request(cr_id, approver, decision, notes)
            .await?;
        self.publish(
            EventKind::ApprovalRecorded,
            json!({
                "approvalId": approval.id,
                "changeRequestId": cr.id,
                "approver": approval.approver,
                "decision": approval.decision,
            }),
        );
        let kind = match decision {
            ApprovalDecision::Approve => EventKind::ChangeRequestApproved,
            ApprovalDecision::Reject => EventKind::ChangeRequestRejected,
        };
        self.publish(kind, json!({"changeRequestId": cr.id, "taskId": cr.task_id}));
        Ok((cr, approval))
    }

    /// The only path that mutates a task after approval. Performs the
    /// target mutation transactionally and is idempotence-guarded: a second
    /// apply on the same request returns `Conflict`.
    pub async fn apply_change_request(&self, cr_id: i64) -> Result<ApplyOutcome> {
        let cr = self.store.get_change_request(cr_id).await?;
        if cr.status != ChangeRequestStatus::Approved {
            return Err(ForemanError::Conflict(format!(
                "change request {cr_id} is {}, expected APPROVED",
                cr.status.as_str()
            )));
        }
        let lock = self.task_lock(cr.task_id).await;
        let guard = lock.lock().await;
        let result = self.apply_locked(&cr).await;
        drop(guard);
        self.release_task_lock(cr.task_id).await;
        result
    }

    async fn apply_locked(&self, cr: &ChangeRequest) -> Result<ApplyOutcome> {
        let outcome = match cr.kind {
            ChangeKind::Edit => {
                let current = self.store.get_task(cr.task_id).await?;
                let active = self.store.active_version(cr.task_id).await?;
                let merged = merge_delta(&active, current.priority, &cr.delta);
                let (applied_cr, task, version) = self
                    .store
                    .apply_edit_change(cr.id, cr.task_id, &merged, active.phase)
                    .await?;
                self.publish_for_task(
                    EventKind::TaskVersionCreated,
                    task.id,
                    Some(version.version),
                    json!({"taskId": task.id, "version": version.version}),
                );
                self.publish_for_task(
                    EventKind::TaskUpdated,
                    task.id,
                    Some(version.version),
                    json!({"taskId": task.id, "changeRequestId": applied_cr.id}),
                );
                ApplyOutcome::Edited { task, version }
            }
            ChangeKind::Split => {
                let source_version = self.store.active_version(cr.task_id).await?;
                let children = inherit_specs(&cr.delta.split_specs, &source_version);
                if children.len() < 2 {
                    return Err(ForemanError::Validation(
                        "a split produces at least two tasks".into(),
                    ));
                }
                let (_, tasks, source) = self
                    .store
                    .apply_split_change(cr.id, cr.task_id, &children, source_version.phase)
                    .await?;
                for task in &tasks {
                    self.publish_for_task(
                        EventKind::TaskCreated,
                        task.id,
                        Some(1),
                        json!({"taskId": task.id, "title": task.title, "splitFrom": source.id}),
                    );
                }
                self.publish_for_task(
                    EventKind::TaskStatusChanged,
                    source.id,
                    None,
                    json!({
                        "taskId": source.id,
                        "to": TaskStatus::Cancelled,
                        "supersededBy": source.metadata.superseded_by,
                    }),
                );
                ApplyOutcome::Split { tasks, source }
            }
            ChangeKind::Merge => {
                let merged_spec = cr.delta.merged_spec.clone().ok_or_else(|| {
                    ForemanError::Validation("merge request has no merged spec".into())
                })?;
                let mut sources = vec![cr.task_id];
                for id in &cr.delta.merge_sources {
                    if !sources.contains(id) {
                        sources.push(*id);
                    }
                }
                let source_version = self.store.active_version(cr.task_id).await?;
                let (_, task) = self
                    .store
                    .apply_merge_change(cr.id, &sources, &merged_spec, source_version.phase)
                    .await?;
                self.publish_for_task(
                    EventKind::TaskCreated,
                    task.id,
                    Some(1),
                    json!({"taskId": task.id, "mergedFrom": task.metadata.merged_from}),
                );
                for source_id in &sources {
                    self.publish_for_task(
                        EventKind::TaskStatusChanged,
                        *source_id,
                        None,
                        json!({"taskId": source_id, "to": TaskStatus::Cancelled, "supersededBy": [task.id]}),
                    );
                }
                ApplyOutcome::Merged { task }
            }
        };
        self.publish(
            EventKind::ChangeRequestApplied,
            json!({"changeRequestId": cr.id, "taskId": cr.task_id}),
        );
        Ok(outcome)
    }

    /// Split a task into the children described by its approved split
    /// request. Without one the call fails with `Preconditions`.
    pub async fn split(&self, task_id: i64) -> Result<ApplyOutcome> {
        let cr = self
            .approved_request_of_kind(task_id, ChangeKind::Split)
            .await?;
        self.apply_change_request(cr.id).await
    }

    /// Merge tasks per the approved merge request targeting `task_id`.
    pub async fn merge(&self, task_id: i64) -> Result<ApplyOutcome> {
        let cr = self
            .approved_request_of_kind(task_id, ChangeKind::Merge)
            .await?;
        self.apply_change_request(cr.id).await
    }

    async fn approved_request_of_kind(
        &self,
        task_id: i64,
        kind: ChangeKind,
    ) -> Result<ChangeRequest> {
        let requests = self.store.list_change_requests(Some(task_id)).await?;
        requests
            .into_iter()
            .rev()
            .find(|cr| cr.kind == kind && cr.status == ChangeRequestStatus::Approved)
            .ok_or_else(|| {
                ForemanError::Preconditions(format!(
                    "task {task_id} has no approved {} change request",
                    kind.as_str()
                ))
            })
    }
}

/// Legal task lifecycle edges. Terminal states absorb everything.
fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Pending, AwaitingApproval)
            | (Pending, Cancelled)
            | (AwaitingApproval, Approved)
            | (AwaitingApproval, Rejected)
            | (AwaitingApproval, Cancelled)
            | (Approved, InProgress)
            | (Approved, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Approved)
            | (InProgress, Rejected)
            | (InProgress, Cancelled)
    )
}

/// Overlay the request delta on the active version's fields.
fn merge_delta(active: &TaskVersion, current_priority: i64, delta: &ChangeDelta) -> TaskSpec {
    TaskSpec {
        title: delta.title.clone().unwrap_or_else(|| active.title.clone()),
        description: delta
            .description
            .clone()
            .unwrap_or_else(|| active.description.clone()),
        priority: delta.priority.unwrap_or(current_priority),
        acceptance_criteria: delta
            .acceptance_criteria
            .clone()
            .unwrap_or_else(|| active.acceptance_criteria.clone()),
        dependencies: delta
            .dependencies
            .clone()
            .unwrap_or_else(|| active.dependencies.clone()),
        gates: delta.gates.clone().unwrap_or_else(|| active.gates.clone()),
    }
}

/// Split children inherit gates and acceptance criteria they do not
/// override.
fn inherit_specs(children: &[TaskSpec], source: &TaskVersion) -> Vec<TaskSpec> {
    children
        .iter()
        .map(|child| {
            let mut spec = child.clone();
            if spec.gates.is_empty() {
                spec.gates = source.gates.clone();
            }
            if spec.acceptance_criteria.is_empty() {
                spec.acceptance_criteria = source.acceptance_criteria.clone();
            }
            spec
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_types::{GateSpec, PassCriteria, Project};
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, Governance, Arc<ProjectStore>, EventBus) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ProjectStore::open(dir.path()).await.unwrap());
        let project = Project {
            id: "p-1".into(),
            name: "demo".into(),
            root: dir.path().display().to_string(),
            current_phase: Phase::Planner,
            default_engine: "null".into(),
            selected_architecture_option: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.init_project(&project).await.unwrap();
        let bus = EventBus::new();
        let governance = Governance::new("p-1", store.clone(), bus.clone());
        (dir, governance, store, bus)
    }

    fn spec(title: &str) -> TaskSpec {
        TaskSpec {
            title: title.into(),
            description: "desc".into(),
            priority: 0,
            acceptance_criteria: vec!["works".into()],
            dependencies: vec![],
            gates: vec![GateSpec {
                name: "tests".into(),
                command: "cargo".into(),
                args: vec!["test".into()],
                pass_criteria: PassCriteria::ExitCodeZero,
                expected: None,
                timeout_secs: Some(60),
                match_stderr: false,
            }],
        }
    }

    async fn approved_task(governance: &Governance) -> Task {
        let task = governance
            .create_task(&spec("Approved work"), Phase::Planner)
            .await
            .unwrap();
        governance.submit_for_approval(task.id).await.unwrap();
        let (task, _) = governance
            .decide_task(task.id, "alice", ApprovalDecision::Approve, None)
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn create_task_publishes_events() {
        let (_dir, governance, _store, bus) = fixture().await;
        let mut rx = bus.subscribe();
        governance
            .create_task(&spec("Add login"), Phase::Planner)
            .await
            .unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::TaskCreated);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::TaskVersionCreated);
    }

    #[tokio::test]
    async fn empty_title_is_validation() {
        let (_dir, governance, _store, _bus) = fixture().await;
        let err = governance
            .create_task(&spec("   "), Phase::Planner)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn post_approval_edit_requires_approved_cr() {
        let (_dir, governance, _store, _bus) = fixture().await;
        let task = approved_task(&governance).await;

        let err = governance
            .update_task(task.id, &spec("Sneaky edit"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "preconditions");

        // With an approved CR the edit is accepted.
        let cr = governance
            .create_change_request(task.id, ChangeKind::Edit, &ChangeDelta::default())
            .await
            .unwrap();
        governance.submit_change_request(cr.id).await.unwrap();
        governance
            .approve_change_request(cr.id, "alice", None)
            .await
            .unwrap();
        let (task, version) = governance
            .update_task(task.id, &spec("Sanctioned edit"))
            .await
            .unwrap();
        assert_eq!(task.title, "Sanctioned edit");
        assert_eq!(version.version, 2);
    }

    #[tokio::test]
    async fn split_without_approved_cr_is_preconditions() {
        let (_dir, governance, _store, _bus) = fixture().await;
        let task = approved_task(&governance).await;
        let err = governance.split(task.id).await.unwrap_err();
        assert_eq!(err.code(), "preconditions");
    }

    #[tokio::test]
    async fn split_flow_creates_children_with_inheritance() {
        let (_dir, governance, store, _bus) = fixture().await;
        let task = approved_task(&governance).await;

        let delta = ChangeDelta {
            split_specs: vec![
                TaskSpec {
                    title: "Part one".into(),
                    ..Default::default()
                },
                TaskSpec {
                    title: "Part two".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let cr = governance
            .create_change_request(task.id, ChangeKind::Split, &delta)
            .await
            .unwrap();
        governance.submit_change_request(cr.id).await.unwrap();
        governance
            .approve_change_request(cr.id, "alice", None)
            .await
            .unwrap();

        let outcome = governance.split(task.id).await.unwrap();
        let ApplyOutcome::Split { tasks, source } = outcome else {
            panic!("expected split outcome");
        };
        assert_eq!(tasks.len(), 2);
        assert_eq!(source.status, TaskStatus::Cancelled);
        assert_eq!(source.metadata.superseded_by.len(), 2);
        // Children inherit the source gates and criteria.
        for child in &tasks {
            let version = store.active_version(child.id).await.unwrap();
            assert_eq!(version.gates.len(), 1);
            assert_eq!(version.acceptance_criteria, vec!["works".to_string()]);
        }

        // Replaying the apply is a conflict, not a second split.
        let err = governance.apply_change_request(cr.id).await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[tokio::test]
    async fn merge_flow_cancels_sources() {
        let (_dir, governance, store, _bus) = fixture().await;
        let a = governance.create_task(&spec("A"), Phase::Planner).await.unwrap();
        let b = governance.create_task(&spec("B"), Phase::Planner).await.unwrap();

        let delta = ChangeDelta {
            merged_spec: Some(TaskSpec {
                title: "A+B".into(),
                ..Default::default()
            }),
            merge_sources: vec![b.id],
            ..Default::default()
        };
        let cr = governance
            .create_change_request(a.id, ChangeKind::Merge, &delta)
            .await
            .unwrap();
        governance.submit_change_request(cr.id).await.unwrap();
        governance
            .approve_change_request(cr.id, "bob", None)
            .await
            .unwrap();

        let ApplyOutcome::Merged { task } = governance.merge(a.id).await.unwrap() else {
            panic!("expected merge outcome");
        };
        assert_eq!(task.metadata.merged_from, vec![a.id, b.id]);
        for source in [a.id, b.id] {
            let loaded = store.get_task(source).await.unwrap();
            assert_eq!(loaded.status, TaskStatus::Cancelled);
            assert_eq!(loaded.metadata.superseded_by, vec![task.id]);
        }
    }

    #[tokio::test]
    async fn illegal_status_transitions_are_rejected() {
        let (_dir, governance, _store, _bus) = fixture().await;
        let task = governance
            .create_task(&spec("Lifecycle"), Phase::Planner)
            .await
            .unwrap();
        // PENDING cannot jump straight to COMPLETED.
        let err = governance
            .set_task_status(task.id, TaskStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    #[tokio::test]
    async fn concurrent_edits_produce_gapless_versions() {
        let (_dir, governance, store, _bus) = fixture().await;
        let task = governance
            .create_task(&spec("Contended"), Phase::Planner)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for round in 0..8 {
            let governance = governance.clone();
            let task_id = task.id;
            handles.push(tokio::spawn(async move {
                governance
                    .update_task(task_id, &spec(&format!("Edit {round}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let versions = store.task_versions(task.id).await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, (1..=9).collect::<Vec<i64>>());
    }
}
