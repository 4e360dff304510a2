use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gates::{GateReport, GateSpec};

/// Workflow phase. Review is the human approval stage between Architect and
/// Coder; it never runs an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planner,
    Architect,
    Review,
    Coder,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planner => "planner",
            Phase::Architect => "architect",
            Phase::Review => "review",
            Phase::Coder => "coder",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planner" => Some(Phase::Planner),
            "architect" => Some(Phase::Architect),
            "review" => Some(Phase::Review),
            "coder" => Some(Phase::Coder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root: String,
    pub current_phase: Phase,
    pub default_engine: String,
    /// Architecture option id chosen after architect-phase approval.
    pub selected_architecture_option: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::AwaitingApproval => "AWAITING_APPROVAL",
            TaskStatus::Approved => "APPROVED",
            TaskStatus::Rejected => "REJECTED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TaskStatus::Pending),
            "IN_PROGRESS" => Some(TaskStatus::InProgress),
            "AWAITING_APPROVAL" => Some(TaskStatus::AwaitingApproval),
            "APPROVED" => Some(TaskStatus::Approved),
            "REJECTED" => Some(TaskStatus::Rejected),
            "COMPLETED" => Some(TaskStatus::Completed),
            "CANCELLED" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses absorb every further transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected | TaskStatus::Completed | TaskStatus::Cancelled
        )
    }

    /// Once a task passed human review, plain edits are no longer allowed.
    pub fn is_post_approval(self) -> bool {
        matches!(
            self,
            TaskStatus::Approved
                | TaskStatus::InProgress
                | TaskStatus::Completed
                | TaskStatus::Rejected
        )
    }
}

/// Free-form task annotations that survive governance operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded_by: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Conventional-commit type used by the coder phase, `feat` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_type: Option<String>,
}

impl TaskMetadata {
    pub fn is_empty(&self) -> bool {
        self.superseded_by.is_empty()
            && self.merged_from.is_empty()
            && self.reason.is_none()
            && self.commit_type.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub phase: Phase,
    pub attempts: i64,
    pub active_version_id: Option<i64>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable snapshot of a task's mutable fields. Versions form a gapless
/// strictly increasing sequence starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskVersion {
    pub id: i64,
    pub task_id: i64,
    pub version: i64,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
}

/// Input payload for task creation, split children, and merge targets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestStatus {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Implemented,
}

impl ChangeRequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeRequestStatus::Draft => "DRAFT",
            ChangeRequestStatus::Submitted => "SUBMITTED",
            ChangeRequestStatus::Approved => "APPROVED",
            ChangeRequestStatus::Rejected => "REJECTED",
            ChangeRequestStatus::Implemented => "IMPLEMENTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DRAFT" => Some(ChangeRequestStatus::Draft),
            "SUBMITTED" => Some(ChangeRequestStatus::Submitted),
            "APPROVED" => Some(ChangeRequestStatus::Approved),
            "REJECTED" => Some(ChangeRequestStatus::Rejected),
            "IMPLEMENTED" => Some(ChangeRequestStatus::Implemented),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChangeRequestStatus::Rejected | ChangeRequestStatus::Implemented
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Edit,
    Split,
    Merge,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Edit => "edit",
            ChangeKind::Split => "split",
            ChangeKind::Merge => "merge",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "edit" => Some(ChangeKind::Edit),
            "split" => Some(ChangeKind::Split),
            "merge" => Some(ChangeKind::Merge),
            _ => None,
        }
    }
}

/// Proposed delta carried by a change request. Edit requests use the flat
/// optional fields; split/merge requests carry their task specs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gates: Option<Vec<GateSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub split_specs: Vec<TaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_spec: Option<TaskSpec>,
    /// Other task ids consumed by a merge request.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_sources: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: i64,
    pub task_id: i64,
    pub kind: ChangeKind,
    pub status: ChangeRequestStatus,
    pub delta: ChangeDelta,
    pub diff_artifact_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "APPROVE",
            ApprovalDecision::Reject => "REJECT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "APPROVE" => Some(ApprovalDecision::Approve),
            "REJECT" => Some(ApprovalDecision::Reject),
            _ => None,
        }
    }
}

/// Immutable decision record. Exactly one of `change_request_id` and
/// `task_version_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: i64,
    pub change_request_id: Option<i64>,
    pub task_version_id: Option<i64>,
    pub approver: String,
    pub decision: ApprovalDecision,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactKind {
    Spec,
    Plan,
    Architecture,
    Adr,
    Transcript,
    Diff,
    Log,
    Other,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Spec => "SPEC",
            ArtifactKind::Plan => "PLAN",
            ArtifactKind::Architecture => "ARCHITECTURE",
            ArtifactKind::Adr => "ADR",
            ArtifactKind::Transcript => "TRANSCRIPT",
            ArtifactKind::Diff => "DIFF",
            ArtifactKind::Log => "LOG",
            ArtifactKind::Other => "OTHER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SPEC" => Some(ArtifactKind::Spec),
            "PLAN" => Some(ArtifactKind::Plan),
            "ARCHITECTURE" => Some(ArtifactKind::Architecture),
            "ADR" => Some(ArtifactKind::Adr),
            "TRANSCRIPT" => Some(ArtifactKind::Transcript),
            "DIFF" => Some(ArtifactKind::Diff),
            "LOG" => Some(ArtifactKind::Log),
            "OTHER" => Some(ArtifactKind::Other),
            _ => None,
        }
    }

    /// Directory segment inside the artifact tree.
    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactKind::Spec => "spec",
            ArtifactKind::Plan => "plan",
            ArtifactKind::Architecture => "architecture",
            ArtifactKind::Adr => "adr",
            ArtifactKind::Transcript => "transcript",
            ArtifactKind::Diff => "diff",
            ArtifactKind::Log => "log",
            ArtifactKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: i64,
    pub kind: ArtifactKind,
    /// Path relative to the project root.
    pub path: String,
    /// Hex-encoded SHA-256 of the contents.
    pub hash: String,
    pub size: i64,
    pub run_id: Option<i64>,
    pub task_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failure => "FAILURE",
            RunStatus::Timeout => "TIMEOUT",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(RunStatus::Running),
            "SUCCESS" => Some(RunStatus::Success),
            "FAILURE" => Some(RunStatus::Failure),
            "TIMEOUT" => Some(RunStatus::Timeout),
            "CANCELLED" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

/// One execution of a phase for a project, optionally owning a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub engine: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub task_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_report: Option<GateReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Singleton per-project row mediating the coder loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {
    pub paused: bool,
    pub max_attempts: i64,
    pub current_task_id: Option<i64>,
}

impl Default for ControlState {
    fn default() -> Self {
        Self {
            paused: false,
            max_attempts: 3,
            current_task_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_round_trips_through_text() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("DONE"), None);
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Rejected.is_terminal());
        assert!(!TaskStatus::Approved.is_terminal());
    }

    #[test]
    fn serde_uses_spec_literals() {
        let json = serde_json::to_string(&TaskStatus::AwaitingApproval).unwrap();
        assert_eq!(json, "\"AWAITING_APPROVAL\"");
        let json = serde_json::to_string(&Phase::Planner).unwrap();
        assert_eq!(json, "\"planner\"");
    }
}
