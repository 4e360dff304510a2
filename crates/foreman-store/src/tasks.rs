use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;

use foreman_types::{
    Approval, ApprovalDecision, ChangeDelta, ChangeKind, ChangeRequest, ChangeRequestStatus,
    Phase, Task, TaskMetadata, TaskSpec, TaskStatus, TaskVersion,
};

use crate::db::{from_sql_ts, phase_from_sql, to_sql_ts, ProjectStore};
use crate::error::{StoreError, StoreResult};

const TASK_COLS: &str = "id, project_id, title, description, priority, status, phase, attempts,
    active_version_id, metadata, created_at, updated_at";
const VERSION_COLS: &str = "id, task_id, version, title, description, acceptance_criteria,
    dependencies, gates, phase, created_at";
const CR_COLS: &str =
    "id, task_id, kind, status, delta, diff_artifact_id, created_at, updated_at";
const APPROVAL_COLS: &str =
    "id, change_request_id, task_version_id, approver, decision, notes, created_at";

impl ProjectStore {
    // ---- tasks ------------------------------------------------------------

    /// Create a task in `PENDING` together with version 1, atomically.
    pub async fn create_task(&self, spec: &TaskSpec, phase: Phase) -> StoreResult<Task> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let project_id: String = tx
            .query_row("SELECT id FROM projects LIMIT 1", [], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound("project row missing".into()))?;
        let task = insert_task_with_version(&tx, &project_id, spec, phase, TaskStatus::Pending)?;
        tx.commit()?;
        Ok(task)
    }

    pub async fn get_task(&self, id: i64) -> StoreResult<Task> {
        let conn = self.conn.lock().await;
        fetch_task(&conn, id)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> StoreResult<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks WHERE status = ?1 ORDER BY priority DESC, id ASC"
                ))?;
                let rows = stmt.query_map(params![status.as_str()], task_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLS} FROM tasks ORDER BY priority DESC, id ASC"
                ))?;
                let rows = stmt.query_map([], task_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub async fn delete_task(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub async fn set_task_status(&self, id: i64, status: TaskStatus) -> StoreResult<Task> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), to_sql_ts(Utc::now()), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        fetch_task(&conn, id)
    }

    pub async fn set_task_metadata(&self, id: i64, metadata: &TaskMetadata) -> StoreResult<Task> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE tasks SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(metadata)?, to_sql_ts(Utc::now()), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        fetch_task(&conn, id)
    }

    pub async fn increment_attempts(&self, id: i64) -> StoreResult<Task> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE tasks SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2",
            params![to_sql_ts(Utc::now()), id],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(format!("task {id}")));
        }
        fetch_task(&conn, id)
    }

    /// Snapshot the task's mutable fields into the next gapless version and
    /// move `active_version_id`, atomically.
    pub async fn revise_task(
        &self,
        task_id: i64,
        spec: &TaskSpec,
        phase: Phase,
    ) -> StoreResult<(Task, TaskVersion)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        fetch_task(&tx, task_id)?;
        let version = insert_version(&tx, task_id, spec, phase)?;
        apply_spec_to_task(&tx, task_id, spec, version.id)?;
        let task = fetch_task(&tx, task_id)?;
        tx.commit()?;
        Ok((task, version))
    }

    // ---- task versions ----------------------------------------------------

    pub async fn task_versions(&self, task_id: i64) -> StoreResult<Vec<TaskVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {VERSION_COLS} FROM task_versions WHERE task_id = ?1 ORDER BY version ASC"
        ))?;
        let rows = stmt.query_map(params![task_id], version_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn get_task_version(&self, id: i64) -> StoreResult<TaskVersion> {
        let conn = self.conn.lock().await;
        fetch_version(&conn, id)
    }

    pub async fn active_version(&self, task_id: i64) -> StoreResult<TaskVersion> {
        let conn = self.conn.lock().await;
        let task = fetch_task(&conn, task_id)?;
        let version_id = task
            .active_version_id
            .ok_or_else(|| StoreError::Integrity(format!("task {task_id} has no active version")))?;
        fetch_version(&conn, version_id)
    }

    // ---- change requests --------------------------------------------------

    pub async fn create_change_request(
        &self,
        task_id: i64,
        kind: ChangeKind,
        delta: &ChangeDelta,
    ) -> StoreResult<ChangeRequest> {
        let conn = self.conn.lock().await;
        fetch_task(&conn, task_id)?;
        let now = to_sql_ts(Utc::now());
        conn.execute(
            "INSERT INTO change_requests (task_id, kind, status, delta, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                task_id,
                kind.as_str(),
                ChangeRequestStatus::Draft.as_str(),
                serde_json::to_string(delta)?,
                now,
            ],
        )?;
        fetch_change_request(&conn, conn.last_insert_rowid())
    }

    pub async fn get_change_request(&self, id: i64) -> StoreResult<ChangeRequest> {
        let conn = self.conn.lock().await;
        fetch_change_request(&conn, id)
    }

    pub async fn list_change_requests(
        &self,
        task_id: Option<i64>,
    ) -> StoreResult<Vec<ChangeRequest>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match task_id {
            Some(task_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CR_COLS} FROM change_requests WHERE task_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![task_id], cr_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {CR_COLS} FROM change_requests ORDER BY id ASC"))?;
                let rows = stmt.query_map([], cr_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Draft requests may rewrite their delta; anything later is frozen.
    pub async fn update_change_request_delta(
        &self,
        id: i64,
        delta: &ChangeDelta,
    ) -> StoreResult<ChangeRequest> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE change_requests SET delta = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                serde_json::to_string(delta)?,
                to_sql_ts(Utc::now()),
                id,
                ChangeRequestStatus::Draft.as_str(),
            ],
        )?;
        if affected == 0 {
            let current = fetch_change_request(&conn, id)?;
            return Err(StoreError::Conflict(format!(
                "change request {id} is {}, only DRAFT requests can be edited",
                current.status.as_str()
            )));
        }
        fetch_change_request(&conn, id)
    }

    pub async fn delete_change_request(&self, id: i64) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "DELETE FROM change_requests WHERE id = ?1 AND status = ?2",
            params![id, ChangeRequestStatus::Draft.as_str()],
        )?;
        if affected == 0 {
            let current = fetch_change_request(&conn, id)?;
            return Err(StoreError::Conflict(format!(
                "change request {id} is {}, only DRAFT requests can be deleted",
                current.status.as_str()
            )));
        }
        Ok(())
    }

    pub async fn submit_change_request(&self, id: i64) -> StoreResult<ChangeRequest> {
        let conn = self.conn.lock().await;
        transition_cr(&conn, id, ChangeRequestStatus::Draft, ChangeRequestStatus::Submitted)?;
        fetch_change_request(&conn, id)
    }

    /// Record the human decision: the approval row and the status move are
    /// one transaction. Only `SUBMITTED` requests can be decided.
    pub async fn decide_change_request(
        &self,
        id: i64,
        approver: &str,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> StoreResult<(ChangeRequest, Approval)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let next = match decision {
            ApprovalDecision::Approve => ChangeRequestStatus::Approved,
            ApprovalDecision::Reject => ChangeRequestStatus::Rejected,
        };
        transition_cr(&tx, id, ChangeRequestStatus::Submitted, next)?;
        tx.execute(
            "INSERT INTO approvals (change_request_id, approver, decision, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, approver, decision.as_str(), notes, to_sql_ts(Utc::now())],
        )?;
        let approval = fetch_approval(&tx, tx.last_insert_rowid())?;
        let cr = fetch_change_request(&tx, id)?;
        tx.commit()?;
        Ok((cr, approval))
    }

    /// Implement an approved edit request: next version, task fields, CR to
    /// `IMPLEMENTED` — atomically. Replaying on the same request hits the
    /// status guard and returns `Conflict`.
    pub async fn apply_edit_change(
        &self,
        cr_id: i64,
        task_id: i64,
        merged: &TaskSpec,
        phase: Phase,
    ) -> StoreResult<(ChangeRequest, Task, TaskVersion)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        transition_cr(
            &tx,
            cr_id,
            ChangeRequestStatus::Approved,
            ChangeRequestStatus::Implemented,
        )?;
        let version = insert_version(&tx, task_id, merged, phase)?;
        apply_spec_to_task(&tx, task_id, merged, version.id)?;
        let task = fetch_task(&tx, task_id)?;
        let cr = fetch_change_request(&tx, cr_id)?;
        tx.commit()?;
        Ok((cr, task, version))
    }

    /// Implement an approved split: create the children, cancel the source
    /// with `superseded_by`, mark the CR implemented — atomically.
    pub async fn apply_split_change(
        &self,
        cr_id: i64,
        source_task_id: i64,
        children: &[TaskSpec],
        phase: Phase,
    ) -> StoreResult<(ChangeRequest, Vec<Task>, Task)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        transition_cr(
            &tx,
            cr_id,
            ChangeRequestStatus::Approved,
            ChangeRequestStatus::Implemented,
        )?;
        let source = fetch_task(&tx, source_task_id)?;
        let project_id = source.project_id.clone();
        let mut new_tasks = Vec::with_capacity(children.len());
        for spec in children {
            new_tasks.push(insert_task_with_version(
                &tx,
                &project_id,
                spec,
                phase,
                TaskStatus::Pending,
            )?);
        }
        let mut metadata = source.metadata.clone();
        metadata.superseded_by = new_tasks.iter().map(|t| t.id).collect();
        metadata.reason = Some("split".into());
        cancel_task(&tx, source_task_id, &metadata)?;
        let source = fetch_task(&tx, source_task_id)?;
        let cr = fetch_change_request(&tx, cr_id)?;
        tx.commit()?;
        Ok((cr, new_tasks, source))
    }

    /// Implement an approved merge: one new task carrying `merged_from`,
    /// every source cancelled with `superseded_by`, CR implemented.
    pub async fn apply_merge_change(
        &self,
        cr_id: i64,
        source_task_ids: &[i64],
        merged: &TaskSpec,
        phase: Phase,
    ) -> StoreResult<(ChangeRequest, Task)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        transition_cr(
            &tx,
            cr_id,
            ChangeRequestStatus::Approved,
            ChangeRequestStatus::Implemented,
        )?;
        let project_id: String = tx
            .query_row("SELECT id FROM projects LIMIT 1", [], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound("project row missing".into()))?;
        let mut new_task =
            insert_task_with_version(&tx, &project_id, merged, phase, TaskStatus::Pending)?;
        let mut merged_meta = new_task.metadata.clone();
        merged_meta.merged_from = source_task_ids.to_vec();
        tx.execute(
            "UPDATE tasks SET metadata = ?1 WHERE id = ?2",
            params![serde_json::to_string(&merged_meta)?, new_task.id],
        )?;
        new_task.metadata = merged_meta;
        for &source_id in source_task_ids {
            let source = fetch_task(&tx, source_id)?;
            let mut metadata = source.metadata.clone();
            metadata.superseded_by = vec![new_task.id];
            metadata.reason = Some("merge".into());
            cancel_task(&tx, source_id, &metadata)?;
        }
        let cr = fetch_change_request(&tx, cr_id)?;
        tx.commit()?;
        Ok((cr, new_task))
    }

    // ---- approvals --------------------------------------------------------

    /// Human decision on a task's active version (the review phase). Guards
    /// the `AWAITING_APPROVAL` status; approval row and status move are one
    /// transaction.
    pub async fn decide_task_version(
        &self,
        task_id: i64,
        approver: &str,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> StoreResult<(Task, Approval)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let task = fetch_task(&tx, task_id)?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {}, expected AWAITING_APPROVAL",
                task.status.as_str()
            )));
        }
        let version_id = task
            .active_version_id
            .ok_or_else(|| StoreError::Integrity(format!("task {task_id} has no active version")))?;
        tx.execute(
            "INSERT INTO approvals (task_version_id, approver, decision, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version_id,
                approver,
                decision.as_str(),
                notes,
                to_sql_ts(Utc::now())
            ],
        )?;
        let approval = fetch_approval(&tx, tx.last_insert_rowid())?;
        let next = match decision {
            ApprovalDecision::Approve => TaskStatus::Approved,
            ApprovalDecision::Reject => TaskStatus::Rejected,
        };
        tx.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), to_sql_ts(Utc::now()), task_id],
        )?;
        let task = fetch_task(&tx, task_id)?;
        tx.commit()?;
        Ok((task, approval))
    }

    pub async fn approvals_for_version(&self, version_id: i64) -> StoreResult<Vec<Approval>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {APPROVAL_COLS} FROM approvals WHERE task_version_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![version_id], approval_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn list_approvals(&self, cr_id: Option<i64>) -> StoreResult<Vec<Approval>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match cr_id {
            Some(cr_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {APPROVAL_COLS} FROM approvals WHERE change_request_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![cr_id], approval_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {APPROVAL_COLS} FROM approvals ORDER BY id ASC"))?;
                let rows = stmt.query_map([], approval_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// True when at least one approval references an `APPROVED` change
    /// request targeting the task.
    pub async fn has_approved_change_request(&self, task_id: i64) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM change_requests WHERE task_id = ?1 AND status = ?2",
            params![task_id, ChangeRequestStatus::Approved.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

// ---- shared sync helpers (callable inside transactions) -------------------

fn json_col<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn status_col(raw: &str) -> rusqlite::Result<TaskStatus> {
    TaskStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown task status `{raw}`").into(),
        )
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: row.get(4)?,
        status: status_col(&row.get::<_, String>(5)?)?,
        phase: phase_from_sql(&row.get::<_, String>(6)?)?,
        attempts: row.get(7)?,
        active_version_id: row.get(8)?,
        metadata: json_col(9, &row.get::<_, String>(9)?)?,
        created_at: from_sql_ts(&row.get::<_, String>(10)?)?,
        updated_at: from_sql_ts(&row.get::<_, String>(11)?)?,
    })
}

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskVersion> {
    Ok(TaskVersion {
        id: row.get(0)?,
        task_id: row.get(1)?,
        version: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        acceptance_criteria: json_col(5, &row.get::<_, String>(5)?)?,
        dependencies: json_col(6, &row.get::<_, String>(6)?)?,
        gates: json_col(7, &row.get::<_, String>(7)?)?,
        phase: phase_from_sql(&row.get::<_, String>(8)?)?,
        created_at: from_sql_ts(&row.get::<_, String>(9)?)?,
    })
}

fn cr_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChangeRequest> {
    let kind_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    Ok(ChangeRequest {
        id: row.get(0)?,
        task_id: row.get(1)?,
        kind: ChangeKind::parse(&kind_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown change kind `{kind_raw}`").into(),
            )
        })?,
        status: ChangeRequestStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown change request status `{status_raw}`").into(),
            )
        })?,
        delta: json_col(4, &row.get::<_, String>(4)?)?,
        diff_artifact_id: row.get(5)?,
        created_at: from_sql_ts(&row.get::<_, String>(6)?)?,
        updated_at: from_sql_ts(&row.get::<_, String>(7)?)?,
    })
}

fn approval_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Approval> {
    let decision_raw: String = row.get(4)?;
    Ok(Approval {
        id: row.get(0)?,
        change_request_id: row.get(1)?,
        task_version_id: row.get(2)?,
        approver: row.get(3)?,
        decision: ApprovalDecision::parse(&decision_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                format!("unknown decision `{decision_raw}`").into(),
            )
        })?,
        notes: row.get(5)?,
        created_at: from_sql_ts(&row.get::<_, String>(6)?)?,
    })
}

fn fetch_task(conn: &Connection, id: i64) -> StoreResult<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLS} FROM tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("task {id}")))
}

fn fetch_version(conn: &Connection, id: i64) -> StoreResult<TaskVersion> {
    conn.query_row(
        &format!("SELECT {VERSION_COLS} FROM task_versions WHERE id = ?1"),
        params![id],
        version_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("task version {id}")))
}

fn fetch_change_request(conn: &Connection, id: i64) -> StoreResult<ChangeRequest> {
    conn.query_row(
        &format!("SELECT {CR_COLS} FROM change_requests WHERE id = ?1"),
        params![id],
        cr_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("change request {id}")))
}

fn fetch_approval(conn: &Connection, id: i64) -> StoreResult<Approval> {
    conn.query_row(
        &format!("SELECT {APPROVAL_COLS} FROM approvals WHERE id = ?1"),
        params![id],
        approval_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("approval {id}")))
}

/// Guarded status transition; zero affected rows means the request was not
/// in the expected state (missing rows surface as `NotFound`).
fn transition_cr(
    conn: &Connection,
    id: i64,
    expected: ChangeRequestStatus,
    next: ChangeRequestStatus,
) -> StoreResult<()> {
    let affected = conn.execute(
        "UPDATE change_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        params![next.as_str(), to_sql_ts(Utc::now()), id, expected.as_str()],
    )?;
    if affected == 0 {
        let current = fetch_change_request(conn, id)?;
        return Err(StoreError::Conflict(format!(
            "change request {id} is {}, expected {}",
            current.status.as_str(),
            expected.as_str()
        )));
    }
    Ok(())
}

fn insert_version(
    conn: &Connection,
    task_id: i64,
    spec: &TaskSpec,
    phase: Phase,
) -> StoreResult<TaskVersion> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM task_versions WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO task_versions
            (task_id, version, title, description, acceptance_criteria, dependencies, gates,
             phase, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            task_id,
            next,
            spec.title,
            spec.description,
            serde_json::to_string(&spec.acceptance_criteria)?,
            serde_json::to_string(&spec.dependencies)?,
            serde_json::to_string(&spec.gates)?,
            phase.as_str(),
            to_sql_ts(Utc::now()),
        ],
    )?;
    fetch_version(conn, conn.last_insert_rowid())
}

fn apply_spec_to_task(
    conn: &Connection,
    task_id: i64,
    spec: &TaskSpec,
    active_version_id: i64,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE tasks SET title = ?1, description = ?2, priority = ?3,
            active_version_id = ?4, updated_at = ?5
         WHERE id = ?6",
        params![
            spec.title,
            spec.description,
            spec.priority,
            active_version_id,
            to_sql_ts(Utc::now()),
            task_id,
        ],
    )?;
    Ok(())
}

fn insert_task_with_version(
    conn: &Connection,
    project_id: &str,
    spec: &TaskSpec,
    phase: Phase,
    status: TaskStatus,
) -> StoreResult<Task> {
    let now = to_sql_ts(Utc::now());
    conn.execute(
        "INSERT INTO tasks (project_id, title, description, priority, status, phase, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            project_id,
            spec.title,
            spec.description,
            spec.priority,
            status.as_str(),
            phase.as_str(),
            now,
        ],
    )?;
    let task_id = conn.last_insert_rowid();
    let version = insert_version(conn, task_id, spec, phase)?;
    conn.execute(
        "UPDATE tasks SET active_version_id = ?1 WHERE id = ?2",
        params![version.id, task_id],
    )?;
    fetch_task(conn, task_id)
}

fn cancel_task(conn: &Connection, task_id: i64, metadata: &TaskMetadata) -> StoreResult<()> {
    conn.execute(
        "UPDATE tasks SET status = ?1, metadata = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            TaskStatus::Cancelled.as_str(),
            serde_json::to_string(metadata)?,
            to_sql_ts(Utc::now()),
            task_id,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ProjectStore;
    use chrono::Utc;
    use foreman_types::{GateSpec, PassCriteria, Project};
    use tempfile::TempDir;

    async fn store_with_project() -> (TempDir, ProjectStore) {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: "demo".into(),
            root: dir.path().display().to_string(),
            current_phase: Phase::Planner,
            default_engine: "null".into(),
            selected_architecture_option: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.init_project(&project).await.unwrap();
        (dir, store)
    }

    fn spec(title: &str) -> TaskSpec {
        TaskSpec {
            title: title.into(),
            description: format!("{title} description"),
            priority: 1,
            acceptance_criteria: vec!["compiles".into()],
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

    #[tokio::test]
    async fn create_task_starts_at_version_one() {
        let (_dir, store) = store_with_project().await;
        let task = store.create_task(&spec("Add login"), Phase::Planner).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let versions = store.task_versions(task.id).await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, 1);
        assert_eq!(task.active_version_id, Some(versions[0].id));
        assert_eq!(versions[0].gates.len(), 1);
    }

    #[tokio::test]
    async fn versions_are_gapless_and_monotonic() {
        let (_dir, store) = store_with_project().await;
        let task = store.create_task(&spec("Refine"), Phase::Planner).await.unwrap();
        for round in 2..=5 {
            let (_, version) = store
                .revise_task(task.id, &spec(&format!("Refine r{round}")), Phase::Architect)
                .await
                .unwrap();
            assert_eq!(version.version, round);
        }
        let versions = store.task_versions(task.id).await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        let task = store.get_task(task.id).await.unwrap();
        assert_eq!(task.active_version_id, Some(versions[4].id));
        assert_eq!(task.title, "Refine r5");
    }

    #[tokio::test]
    async fn change_request_lifecycle_and_replay_conflict() {
        let (_dir, store) = store_with_project().await;
        let task = store.create_task(&spec("Split me"), Phase::Planner).await.unwrap();
        let cr = store
            .create_change_request(task.id, ChangeKind::Edit, &ChangeDelta::default())
            .await
            .unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Draft);

        let cr = store.submit_change_request(cr.id).await.unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Submitted);
        // Double submit hits the guard.
        assert!(matches!(
            store.submit_change_request(cr.id).await,
            Err(StoreError::Conflict(_))
        ));

        let (cr, approval) = store
            .decide_change_request(cr.id, "alice", ApprovalDecision::Approve, Some("lgtm"))
            .await
            .unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Approved);
        assert_eq!(approval.approver, "alice");
        assert_eq!(approval.change_request_id, Some(cr.id));

        let (cr, _, version) = store
            .apply_edit_change(cr.id, task.id, &spec("Split me v2"), Phase::Review)
            .await
            .unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Implemented);
        assert_eq!(version.version, 2);

        // Replaying apply is a Conflict, not a second mutation.
        assert!(matches!(
            store
                .apply_edit_change(cr.id, task.id, &spec("again"), Phase::Review)
                .await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.task_versions(task.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn split_creates_children_and_cancels_source() {
        let (_dir, store) = store_with_project().await;
        let task = store.create_task(&spec("Big feature"), Phase::Planner).await.unwrap();
        let cr = store
            .create_change_request(task.id, ChangeKind::Split, &ChangeDelta::default())
            .await
            .unwrap();
        store.submit_change_request(cr.id).await.unwrap();
        store
            .decide_change_request(cr.id, "alice", ApprovalDecision::Approve, None)
            .await
            .unwrap();

        let children = vec![spec("Part one"), spec("Part two")];
        let (cr, new_tasks, source) = store
            .apply_split_change(cr.id, task.id, &children, Phase::Review)
            .await
            .unwrap();
        assert_eq!(cr.status, ChangeRequestStatus::Implemented);
        assert_eq!(new_tasks.len(), 2);
        assert_eq!(source.status, TaskStatus::Cancelled);
        assert_eq!(
            source.metadata.superseded_by,
            new_tasks.iter().map(|t| t.id).collect::<Vec<_>>()
        );
        for child in &new_tasks {
            assert_eq!(child.status, TaskStatus::Pending);
            let version = store.active_version(child.id).await.unwrap();
            assert_eq!(version.version, 1);
        }
    }

    #[tokio::test]
    async fn merge_creates_one_task_and_cancels_sources() {
        let (_dir, store) = store_with_project().await;
        let a = store.create_task(&spec("A"), Phase::Planner).await.unwrap();
        let b = store.create_task(&spec("B"), Phase::Planner).await.unwrap();
        let cr = store
            .create_change_request(a.id, ChangeKind::Merge, &ChangeDelta::default())
            .await
            .unwrap();
        store.submit_change_request(cr.id).await.unwrap();
        store
            .decide_change_request(cr.id, "bob", ApprovalDecision::Approve, None)
            .await
            .unwrap();

        let (_, merged) = store
            .apply_merge_change(cr.id, &[a.id, b.id], &spec("A and B"), Phase::Review)
            .await
            .unwrap();
        assert_eq!(merged.metadata.merged_from, vec![a.id, b.id]);
        for id in [a.id, b.id] {
            let source = store.get_task(id).await.unwrap();
            assert_eq!(source.status, TaskStatus::Cancelled);
            assert_eq!(source.metadata.superseded_by, vec![merged.id]);
        }
    }

    #[tokio::test]
    async fn version_approval_moves_awaiting_task() {
        let (_dir, store) = store_with_project().await;
        let task = store.create_task(&spec("Review me"), Phase::Planner).await.unwrap();
        // Not awaiting approval yet.
        assert!(matches!(
            store
                .decide_task_version(task.id, "alice", ApprovalDecision::Approve, None)
                .await,
            Err(StoreError::Conflict(_))
        ));

        store
            .set_task_status(task.id, TaskStatus::AwaitingApproval)
            .await
            .unwrap();
        let (task, approval) = store
            .decide_task_version(task.id, "alice", ApprovalDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert_eq!(approval.task_version_id, task.active_version_id);
    }
}
