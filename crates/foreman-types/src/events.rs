use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Every state change in Foreman crosses an event publication boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    TaskCreated,
    TaskUpdated,
    TaskStatusChanged,
    TaskDeleted,
    TaskVersionCreated,
    ChangeRequestCreated,
    ChangeRequestSubmitted,
    ChangeRequestApproved,
    ChangeRequestRejected,
    ChangeRequestApplied,
    ApprovalRecorded,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    GateExecuted,
    GatePassed,
    GateFailed,
    ArtifactCreated,
    RunStarted,
    RunLog,
    RunEnded,
    VcsCommitted,
    Security,
    SubscriberLagged,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProjectCreated => "project_created",
            EventKind::ProjectUpdated => "project_updated",
            EventKind::ProjectDeleted => "project_deleted",
            EventKind::TaskCreated => "task_created",
            EventKind::TaskUpdated => "task_updated",
            EventKind::TaskStatusChanged => "task_status_changed",
            EventKind::TaskDeleted => "task_deleted",
            EventKind::TaskVersionCreated => "task_version_created",
            EventKind::ChangeRequestCreated => "change_request_created",
            EventKind::ChangeRequestSubmitted => "change_request_submitted",
            EventKind::ChangeRequestApproved => "change_request_approved",
            EventKind::ChangeRequestRejected => "change_request_rejected",
            EventKind::ChangeRequestApplied => "change_request_applied",
            EventKind::ApprovalRecorded => "approval_recorded",
            EventKind::PhaseStarted => "phase_started",
            EventKind::PhaseCompleted => "phase_completed",
            EventKind::PhaseFailed => "phase_failed",
            EventKind::GateExecuted => "gate_executed",
            EventKind::GatePassed => "gate_passed",
            EventKind::GateFailed => "gate_failed",
            EventKind::ArtifactCreated => "artifact_created",
            EventKind::RunStarted => "run_started",
            EventKind::RunLog => "run_log",
            EventKind::RunEnded => "run_ended",
            EventKind::VcsCommitted => "vcs_committed",
            EventKind::Security => "security",
            EventKind::SubscriberLagged => "subscriber_lagged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        const ALL: [EventKind; 27] = [
            EventKind::ProjectCreated,
            EventKind::ProjectUpdated,
            EventKind::ProjectDeleted,
            EventKind::TaskCreated,
            EventKind::TaskUpdated,
            EventKind::TaskStatusChanged,
            EventKind::TaskDeleted,
            EventKind::TaskVersionCreated,
            EventKind::ChangeRequestCreated,
            EventKind::ChangeRequestSubmitted,
            EventKind::ChangeRequestApproved,
            EventKind::ChangeRequestRejected,
            EventKind::ChangeRequestApplied,
            EventKind::ApprovalRecorded,
            EventKind::PhaseStarted,
            EventKind::PhaseCompleted,
            EventKind::PhaseFailed,
            EventKind::GateExecuted,
            EventKind::GatePassed,
            EventKind::GateFailed,
            EventKind::ArtifactCreated,
            EventKind::RunStarted,
            EventKind::RunLog,
            EventKind::RunEnded,
            EventKind::VcsCommitted,
            EventKind::Security,
            EventKind::SubscriberLagged,
        ];
        ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

/// A typed event as delivered to subscribers and forwarded over the
/// external channel. `seq` is a per-project monotonic sequence stamped by
/// the bus at publication; `(kind, entity_id, entity_version)` makes
/// redelivery idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub seq: u64,
    pub kind: EventKind,
    pub project_id: String,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_version: Option<i64>,
    pub payload: Value,
}

impl WorkflowEvent {
    pub fn new(kind: EventKind, project_id: impl Into<String>, payload: Value) -> Self {
        Self {
            seq: 0,
            kind,
            project_id: project_id.into(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            entity_id: None,
            entity_version: None,
            payload,
        }
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>, version: Option<i64>) -> Self {
        self.entity_id = Some(entity_id.into());
        self.entity_version = version;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }
}
