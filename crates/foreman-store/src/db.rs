use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use foreman_types::{ControlState, Phase, Project, WorkflowEvent};

use crate::error::{StoreError, StoreResult};

const CURRENT_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    root TEXT NOT NULL,
    current_phase TEXT NOT NULL,
    default_engine TEXT NOT NULL,
    selected_architecture_option TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    phase TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    active_version_id INTEGER,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    dependencies TEXT NOT NULL DEFAULT '[]',
    gates TEXT NOT NULL DEFAULT '[]',
    phase TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(task_id, version)
);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    engine TEXT NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    task_id INTEGER REFERENCES tasks(id) ON DELETE CASCADE,
    gate_report TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    path TEXT NOT NULL,
    hash TEXT NOT NULL,
    size INTEGER NOT NULL,
    run_id INTEGER REFERENCES runs(id) ON DELETE SET NULL,
    task_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    UNIQUE(kind, hash)
);

CREATE TABLE IF NOT EXISTS change_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    delta TEXT NOT NULL DEFAULT '{}',
    diff_artifact_id INTEGER REFERENCES artifacts(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS approvals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_request_id INTEGER REFERENCES change_requests(id) ON DELETE CASCADE,
    task_version_id INTEGER REFERENCES task_versions(id) ON DELETE CASCADE,
    approver TEXT NOT NULL,
    decision TEXT NOT NULL,
    notes TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS control_state (
    project_id TEXT PRIMARY KEY REFERENCES projects(id) ON DELETE CASCADE,
    paused INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    current_task_id INTEGER
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY,
    kind TEXT NOT NULL,
    project_id TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    entity_id TEXT,
    entity_version INTEGER,
    timestamp TEXT NOT NULL,
    payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_task_versions_task ON task_versions(task_id);
CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
CREATE INDEX IF NOT EXISTS idx_change_requests_task ON change_requests(task_id);
";

/// The single writer for one project's database. The connection lives
/// behind an async mutex, so every DAO call observes its own writes and
/// short write transactions serialize naturally.
pub struct ProjectStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl ProjectStore {
    /// Open (or create) the store under `<project_root>/.foreman/foreman.db`
    /// and bring the schema to the latest version.
    pub async fn open(project_root: &Path) -> StoreResult<Self> {
        let state_dir = project_root.join(".foreman");
        tokio::fs::create_dir_all(&state_dir).await?;
        let db_path = state_dir.join("foreman.db");

        let conn = Connection::open(&db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // WAL keeps readers out of the writer's way; the pragma returns a
        // row, so query_row is used to consume it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Idempotent, version-stamped migrations. A fresh database lands on
    /// the latest schema in one pass.
    async fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        )?;
        let recorded: Option<i64> = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()?;
        let mut version = recorded.unwrap_or(0);
        if recorded.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])?;
        }

        if version < 1 {
            conn.execute_batch(SCHEMA_V1)?;
            version = 1;
        }

        if version != CURRENT_SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "schema version {version} is newer than supported {CURRENT_SCHEMA_VERSION}"
            )));
        }
        conn.execute("UPDATE schema_version SET version = ?1", params![version])?;
        Ok(())
    }

    // ---- project row ------------------------------------------------------

    pub async fn init_project(&self, project: &Project) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, name, root, current_phase, default_engine,
                selected_architecture_option, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO NOTHING",
            params![
                project.id,
                project.name,
                project.root,
                project.current_phase.as_str(),
                project.default_engine,
                project.selected_architecture_option,
                to_sql_ts(project.created_at),
                to_sql_ts(project.updated_at),
            ],
        )?;
        conn.execute(
            "INSERT INTO control_state (project_id) VALUES (?1)
             ON CONFLICT(project_id) DO NOTHING",
            params![project.id],
        )?;
        Ok(())
    }

    pub async fn project(&self) -> StoreResult<Project> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, root, current_phase, default_engine,
                    selected_architecture_option, created_at, updated_at
             FROM projects LIMIT 1",
            [],
            project_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound("project row missing".into()))
    }

    pub async fn update_project(
        &self,
        current_phase: Option<Phase>,
        default_engine: Option<&str>,
        selected_architecture_option: Option<Option<&str>>,
    ) -> StoreResult<Project> {
        {
            let conn = self.conn.lock().await;
            if let Some(phase) = current_phase {
                conn.execute(
                    "UPDATE projects SET current_phase = ?1, updated_at = ?2",
                    params![phase.as_str(), to_sql_ts(Utc::now())],
                )?;
            }
            if let Some(engine) = default_engine {
                conn.execute(
                    "UPDATE projects SET default_engine = ?1, updated_at = ?2",
                    params![engine, to_sql_ts(Utc::now())],
                )?;
            }
            if let Some(option) = selected_architecture_option {
                conn.execute(
                    "UPDATE projects SET selected_architecture_option = ?1, updated_at = ?2",
                    params![option, to_sql_ts(Utc::now())],
                )?;
            }
        }
        self.project().await
    }

    /// Cascade-delete every owned row. The registry entry and the database
    /// file itself are the caller's concern.
    pub async fn delete_project_rows(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM projects", [])?;
        Ok(())
    }

    // ---- control state ----------------------------------------------------

    pub async fn control_state(&self) -> StoreResult<ControlState> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT paused, max_attempts, current_task_id FROM control_state LIMIT 1",
            [],
            |row| {
                Ok(ControlState {
                    paused: row.get::<_, i64>(0)? != 0,
                    max_attempts: row.get(1)?,
                    current_task_id: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound("control_state row missing".into()))
    }

    pub async fn set_paused(&self, paused: bool) -> StoreResult<ControlState> {
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE control_state SET paused = ?1",
                params![i64::from(paused)],
            )?;
        }
        self.control_state().await
    }

    pub async fn set_max_attempts(&self, max_attempts: i64) -> StoreResult<ControlState> {
        if max_attempts < 1 {
            return Err(StoreError::Conflict("max_attempts must be >= 1".into()));
        }
        {
            let conn = self.conn.lock().await;
            conn.execute(
                "UPDATE control_state SET max_attempts = ?1",
                params![max_attempts],
            )?;
        }
        self.control_state().await
    }

    pub async fn set_current_task(&self, task_id: Option<i64>) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE control_state SET current_task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    // ---- event audit rows -------------------------------------------------

    pub async fn append_event(&self, event: &WorkflowEvent) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO events
                (seq, kind, project_id, correlation_id, entity_id, entity_version, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.seq as i64,
                event.kind.as_str(),
                event.project_id,
                event.correlation_id,
                event.entity_id,
                event.entity_version,
                to_sql_ts(event.timestamp),
                serde_json::to_string(&event.payload)?,
            ],
        )?;
        Ok(())
    }

    pub async fn events_since(&self, seq: u64, limit: usize) -> StoreResult<Vec<WorkflowEvent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, kind, project_id, correlation_id, entity_id, entity_version,
                    timestamp, payload
             FROM events WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![seq as i64, limit as i64], event_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub async fn max_event_seq(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().await;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }
}

pub(crate) fn to_sql_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn from_sql_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

pub(crate) fn phase_from_sql(raw: &str) -> rusqlite::Result<Phase> {
    Phase::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown phase `{raw}`").into(),
        )
    })
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        root: row.get(2)?,
        current_phase: phase_from_sql(&row.get::<_, String>(3)?)?,
        default_engine: row.get(4)?,
        selected_architecture_option: row.get(5)?,
        created_at: from_sql_ts(&row.get::<_, String>(6)?)?,
        updated_at: from_sql_ts(&row.get::<_, String>(7)?)?,
    })
}

type EventRowResult = std::result::Result<WorkflowEvent, StoreError>;

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRowResult> {
    let kind_raw: String = row.get(1)?;
    let payload_raw: String = row.get(7)?;
    let Some(kind) = foreman_types::EventKind::parse(&kind_raw) else {
        return Ok(Err(StoreError::Storage(format!(
            "unknown event kind `{kind_raw}`"
        ))));
    };
    let payload = match serde_json::from_str(&payload_raw) {
        Ok(payload) => payload,
        Err(err) => return Ok(Err(StoreError::Storage(format!("event payload: {err}")))),
    };
    Ok(Ok(WorkflowEvent {
        seq: row.get::<_, i64>(0)?.max(0) as u64,
        kind,
        project_id: row.get(2)?,
        correlation_id: row.get(3)?,
        entity_id: row.get(4)?,
        entity_version: row.get(5)?,
        timestamp: from_sql_ts(&row.get::<_, String>(6)?)?,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_types::{EventKind, WorkflowEvent};
    use serde_json::json;
    use tempfile::TempDir;

    pub(crate) fn demo_project(root: &Path) -> Project {
        Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: "demo".into(),
            root: root.display().to_string(),
            current_phase: Phase::Planner,
            default_engine: "null".into(),
            selected_architecture_option: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_creates_schema_and_project_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let project = demo_project(dir.path());
        store.init_project(&project).await.unwrap();

        let loaded = store.project().await.unwrap();
        assert_eq!(loaded.name, "demo");
        assert_eq!(loaded.current_phase, Phase::Planner);

        // Re-opening migrates idempotently.
        drop(store);
        let store = ProjectStore::open(dir.path()).await.unwrap();
        assert_eq!(store.project().await.unwrap().id, project.id);
    }

    #[tokio::test]
    async fn control_state_defaults_and_updates() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        store.init_project(&demo_project(dir.path())).await.unwrap();

        let state = store.control_state().await.unwrap();
        assert!(!state.paused);
        assert_eq!(state.max_attempts, 3);

        let state = store.set_paused(true).await.unwrap();
        assert!(state.paused);
        let state = store.set_max_attempts(5).await.unwrap();
        assert_eq!(state.max_attempts, 5);
        assert!(store.set_max_attempts(0).await.is_err());
    }

    #[tokio::test]
    async fn events_persist_in_sequence_order() {
        let dir = TempDir::new().unwrap();
        let store = ProjectStore::open(dir.path()).await.unwrap();
        let project = demo_project(dir.path());
        store.init_project(&project).await.unwrap();

        for seq in 1..=3u64 {
            let mut event = WorkflowEvent::new(
                EventKind::TaskCreated,
                project.id.clone(),
                json!({"n": seq}),
            );
            event.seq = seq;
            store.append_event(&event).await.unwrap();
        }

        let events = store.events_since(0, 100).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.max_event_seq().await.unwrap(), 3);

        let tail = store.events_since(1, 100).await.unwrap();
        assert_eq!(tail.len(), 2);
    }
}
