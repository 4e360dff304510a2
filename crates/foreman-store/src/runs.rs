use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use foreman_types::{ArtifactKind, ArtifactMeta, GateReport, Phase, Run, RunStatus};

use crate::db::{from_sql_ts, phase_from_sql, to_sql_ts, ProjectStore};
use crate::error::{StoreError, StoreResult};

const RUN_COLS: &str =
    "id, engine, phase, status, task_id, gate_report, error, started_at, ended_at";
const ARTIFACT_COLS: &str = "id, kind, path, hash, size, run_id, task_id, created_at";

impl ProjectStore {
    // ---- runs -------------------------------------------------------------

    pub async fn create_run(
        &self,
        engine: &str,
        phase: Phase,
        task_id: Option<i64>,
    ) -> StoreResult<Run> {
        let conn = self.conn.lock().await;
        let project_id: String = conn
            .query_row("SELECT id FROM projects LIMIT 1", [], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound("project row missing".into()))?;
        conn.execute(
            "INSERT INTO runs (project_id, engine, phase, status, task_id, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                engine,
                phase.as_str(),
                RunStatus::Running.as_str(),
                task_id,
                to_sql_ts(Utc::now()),
            ],
        )?;
        fetch_run(&conn, conn.last_insert_rowid())
    }

    /// Terminal transition for a run. A run ends exactly once; finishing a
    /// non-running run is a conflict.
    pub async fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        gate_report: Option<&GateReport>,
        error: Option<&str>,
    ) -> StoreResult<Run> {
        if status == RunStatus::Running {
            return Err(StoreError::Conflict("RUNNING is not a terminal status".into()));
        }
        let conn = self.conn.lock().await;
        let report_json = match gate_report {
            Some(report) => Some(serde_json::to_string(report)?),
            None => None,
        };
        let affected = conn.execute(
            "UPDATE runs SET status = ?1, gate_report = ?2, error = ?3, ended_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                status.as_str(),
                report_json,
                error,
                to_sql_ts(Utc::now()),
                id,
                RunStatus::Running.as_str(),
            ],
        )?;
        if affected == 0 {
            let current = fetch_run(&conn, id)?;
            return Err(StoreError::Conflict(format!(
                "run {id} already ended with {}",
                current.status.as_str()
            )));
        }
        fetch_run(&conn, id)
    }

    pub async fn get_run(&self, id: i64) -> StoreResult<Run> {
        let conn = self.conn.lock().await;
        fetch_run(&conn, id)
    }

    pub async fn list_runs(&self, task_id: Option<i64>) -> StoreResult<Vec<Run>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match task_id {
            Some(task_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLS} FROM runs WHERE task_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![task_id], run_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {RUN_COLS} FROM runs ORDER BY id ASC"))?;
                let rows = stmt.query_map([], run_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// A task may only be `COMPLETED` when such a run exists.
    pub async fn has_passing_run(&self, task_id: i64) -> StoreResult<bool> {
        let runs = self.list_runs(Some(task_id)).await?;
        Ok(runs.iter().any(|run| {
            run.status == RunStatus::Success
                && run
                    .gate_report
                    .as_ref()
                    .map(|report| report.all_passed)
                    .unwrap_or(false)
        }))
    }

    // ---- artifact metadata rows -------------------------------------------

    pub async fn insert_artifact(
        &self,
        kind: ArtifactKind,
        path: &str,
        hash: &str,
        size: i64,
        run_id: Option<i64>,
        task_id: Option<i64>,
    ) -> StoreResult<ArtifactMeta> {
        let conn = self.conn.lock().await;
        let project_id: String = conn
            .query_row("SELECT id FROM projects LIMIT 1", [], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound("project row missing".into()))?;
        conn.execute(
            "INSERT INTO artifacts (project_id, kind, path, hash, size, run_id, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                project_id,
                kind.as_str(),
                path,
                hash,
                size,
                run_id,
                task_id,
                to_sql_ts(Utc::now()),
            ],
        )?;
        fetch_artifact(&conn, conn.last_insert_rowid())
    }

    pub async fn get_artifact(&self, id: i64) -> StoreResult<ArtifactMeta> {
        let conn = self.conn.lock().await;
        fetch_artifact(&conn, id)
    }

    pub async fn find_artifact_by_hash(
        &self,
        kind: ArtifactKind,
        hash: &str,
    ) -> StoreResult<Option<ArtifactMeta>> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                &format!("SELECT {ARTIFACT_COLS} FROM artifacts WHERE kind = ?1 AND hash = ?2"),
                params![kind.as_str(), hash],
                artifact_from_row,
            )
            .optional()?)
    }

    pub async fn list_artifacts(
        &self,
        kind: Option<ArtifactKind>,
    ) -> StoreResult<Vec<ArtifactMeta>> {
        let conn = self.conn.lock().await;
        let mut out = Vec::new();
        match kind {
            Some(kind) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ARTIFACT_COLS} FROM artifacts WHERE kind = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![kind.as_str()], artifact_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt =
                    conn.prepare(&format!("SELECT {ARTIFACT_COLS} FROM artifacts ORDER BY id ASC"))?;
                let rows = stmt.query_map([], artifact_from_row)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let status_raw: String = row.get(3)?;
    let report_raw: Option<String> = row.get(5)?;
    let gate_report = match report_raw {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
        })?),
        None => None,
    };
    let ended_raw: Option<String> = row.get(8)?;
    let ended_at = match ended_raw {
        Some(raw) => Some(from_sql_ts(&raw)?),
        None => None,
    };
    Ok(Run {
        id: row.get(0)?,
        engine: row.get(1)?,
        phase: phase_from_sql(&row.get::<_, String>(2)?)?,
        status: RunStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                format!("unknown run status `{status_raw}`").into(),
            )
        })?,
        task_id: row.get(4)?,
        gate_report,
        error: row.get(6)?,
        started_at: from_sql_ts(&row.get::<_, String>(7)?)?,
        ended_at,
    })
}

fn artifact_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ArtifactMeta> {
    let kind_raw: String = row.get(1)?;
    Ok(ArtifactMeta {
        id: row.get(0)?,
        kind: ArtifactKind::parse(&kind_raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown artifact kind `{kind_raw}`").into(),
            )
        })?,
        path: row.get(2)?,
        hash: row.get(3)?,
        size: row.get(4)?,
        run_id: row.get(5)?,
        task_id: row.get(6)?,
        created_at: from_sql_ts(&row.get::<_, String>(7)?)?,
    })
}

fn fetch_run(conn: &Connection, id: i64) -> StoreResult<Run> {
    conn.query_row(
        &format!("SELECT {RUN_COLS} FROM runs WHERE id = ?1"),
        params![id],
        run_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("run {id}")))
}

fn fetch_artifact(conn: &Connection, id: i64) -> StoreResult<ArtifactMeta> {
    conn.query_row(
        &format!("SELECT {ARTIFACT_COLS} FROM artifacts WHERE id = ?1"),
        params![id],
        artifact_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("artifact {id}")))
}
