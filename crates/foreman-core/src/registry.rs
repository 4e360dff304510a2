use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use foreman_engines::EngineRegistry;
use foreman_sandbox::{EventSink, Sandbox};
use foreman_store::{ArtifactStore, ProjectStore};
use foreman_types::{EventKind, ForemanError, Phase, Project, Result, WorkflowEvent};

use crate::config::ProjectConfig;
use crate::event_bus::{spawn_audit_writer, EventBus};
use crate::governance::Governance;
use crate::vcs::GitAdapter;

/// Everything one project needs at runtime, assembled at open and passed
/// explicitly — no global singletons, so tests build fresh instances.
pub struct ProjectContext {
    pub project_id: String,
    pub root: PathBuf,
    pub store: Arc<ProjectStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub bus: EventBus,
    pub governance: Governance,
    pub engines: EngineRegistry,
    /// Serializes coder-loop scheduling decisions for this project.
    pub control_lock: Arc<Mutex<()>>,
    config: RwLock<ProjectConfig>,
    sandbox: RwLock<Sandbox>,
    audit_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProjectContext {
    pub async fn open(project_id: &str, root: &Path) -> Result<Arc<Self>> {
        let config = ProjectConfig::load(root).await?;
        config.validate()?;

        let store = Arc::new(ProjectStore::open(root).await?);
        let start_seq = store.max_event_seq().await?;
        let bus = EventBus::with_start_seq(crate::event_bus::DEFAULT_RING_CAPACITY, start_seq);

        let events: EventSink = {
            let bus = bus.clone();
            Arc::new(move |event: WorkflowEvent| {
                bus.publish(event);
            })
        };
        let sandbox = Sandbox::new(project_id, root, config.sandbox.clone()).with_events(events);
        let engines = EngineRegistry::new(config.engines_config(), sandbox.clone());
        let governance = Governance::new(project_id, store.clone(), bus.clone());
        let audit = spawn_audit_writer(bus.clone(), store.clone(), project_id.to_string());

        Ok(Arc::new(Self {
            project_id: project_id.to_string(),
            root: root.to_path_buf(),
            store,
            artifacts: Arc::new(ArtifactStore::new(root)),
            bus,
            governance,
            engines,
            control_lock: Arc::new(Mutex::new(())),
            config: RwLock::new(config),
            sandbox: RwLock::new(sandbox),
            audit_task: std::sync::Mutex::new(Some(audit)),
        }))
    }

    pub async fn config(&self) -> ProjectConfig {
        self.config.read().await.clone()
    }

    pub async fn sandbox(&self) -> Sandbox {
        self.sandbox.read().await.clone()
    }

    pub async fn vcs(&self) -> GitAdapter {
        GitAdapter::new(self.project_id.clone(), self.sandbox().await).with_bus(self.bus.clone())
    }

    pub async fn project(&self) -> Result<Project> {
        Ok(self.store.project().await?)
    }

    /// Persist a new configuration and rebuild the dependent services.
    pub async fn update_config(&self, new_config: ProjectConfig) -> Result<ProjectConfig> {
        new_config.validate()?;
        new_config.save(&self.root).await?;

        let events: EventSink = {
            let bus = self.bus.clone();
            Arc::new(move |event: WorkflowEvent| {
                bus.publish(event);
            })
        };
        let sandbox = Sandbox::new(&self.project_id, &self.root, new_config.sandbox.clone())
            .with_events(events);
        self.engines
            .reload(new_config.engines_config(), sandbox.clone())
            .await;
        *self.sandbox.write().await = sandbox;
        *self.config.write().await = new_config.clone();

        if let Some(engine) = &new_config.default_engine {
            self.store
                .update_project(None, Some(engine.as_str()), None)
                .await?;
        }
        self.bus.publish(WorkflowEvent::new(
            EventKind::ProjectUpdated,
            self.project_id.clone(),
            json!({"projectId": self.project_id, "config": "updated"}),
        ));
        Ok(new_config)
    }

    fn abort_background(&self) {
        if let Some(handle) = self.audit_task.lock().expect("audit handle").take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectRecord {
    id: String,
    name: String,
    root: String,
}

/// The only cross-project state: a name → root index persisted as JSON
/// under the engine state dir, plus the live contexts.
pub struct ProjectRegistry {
    state_dir: PathBuf,
    pub global_bus: EventBus,
    inner: RwLock<HashMap<String, (ProjectRecord, Arc<ProjectContext>)>>,
}

impl ProjectRegistry {
    pub async fn load(state_dir: impl AsRef<Path>) -> Result<Self> {
        let state_dir = state_dir.as_ref().to_path_buf();
        fs::create_dir_all(&state_dir).await?;
        let index_path = state_dir.join("projects.json");
        let records: Vec<ProjectRecord> = if index_path.exists() {
            let raw = fs::read_to_string(&index_path).await?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut inner = HashMap::new();
        for record in records {
            let root = PathBuf::from(&record.root);
            match ProjectContext::open(&record.id, &root).await {
                Ok(context) => {
                    inner.insert(record.id.clone(), (record, context));
                }
                Err(err) => {
                    tracing::warn!(
                        project = %record.name,
                        root = %record.root,
                        ?err,
                        "skipping project that failed to open"
                    );
                }
            }
        }

        Ok(Self {
            state_dir,
            global_bus: EventBus::new(),
            inner: RwLock::new(inner),
        })
    }

    pub async fn create_project(
        &self,
        name: &str,
        root: &Path,
        default_engine: Option<&str>,
    ) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(ForemanError::Validation("project name must not be empty".into()));
        }
        {
            let inner = self.inner.read().await;
            if inner.values().any(|(record, _)| record.name == name) {
                return Err(ForemanError::Conflict(format!(
                    "project `{name}` already exists"
                )));
            }
        }
        fs::create_dir_all(root).await?;

        let id = Uuid::new_v4().to_string();
        let context = ProjectContext::open(&id, root).await?;
        let engine = match default_engine {
            Some(engine) => engine.to_string(),
            None => context
                .config()
                .await
                .default_engine
                .unwrap_or_else(|| "null".to_string()),
        };
        let now = Utc::now();
        let project = Project {
            id: id.clone(),
            name: name.to_string(),
            root: root.display().to_string(),
            current_phase: Phase::Planner,
            default_engine: engine,
            selected_architecture_option: None,
            created_at: now,
            updated_at: now,
        };
        context.store.init_project(&project).await?;

        let record = ProjectRecord {
            id: id.clone(),
            name: name.to_string(),
            root: root.display().to_string(),
        };
        {
            let mut inner = self.inner.write().await;
            inner.insert(id.clone(), (record, context.clone()));
        }
        self.flush().await?;

        let payload = json!({"projectId": id, "name": name});
        self.global_bus.publish(
            WorkflowEvent::new(EventKind::ProjectCreated, id.clone(), payload.clone())
                .with_entity(format!("project:{id}"), None),
        );
        context.bus.publish(
            WorkflowEvent::new(EventKind::ProjectCreated, id.clone(), payload)
                .with_entity(format!("project:{id}"), None),
        );
        Ok(project)
    }

    pub async fn context(&self, project_id: &str) -> Result<Arc<ProjectContext>> {
        let inner = self.inner.read().await;
        inner
            .get(project_id)
            .map(|(_, context)| context.clone())
            .ok_or_else(|| ForemanError::NotFound(format!("project {project_id}")))
    }

    pub async fn context_by_name(&self, name: &str) -> Result<Arc<ProjectContext>> {
        let inner = self.inner.read().await;
        inner
            .values()
            .find(|(record, _)| record.name == name)
            .map(|(_, context)| context.clone())
            .ok_or_else(|| ForemanError::NotFound(format!("project `{name}`")))
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let contexts: Vec<Arc<ProjectContext>> = {
            let inner = self.inner.read().await;
            inner.values().map(|(_, c)| c.clone()).collect()
        };
        let mut projects = Vec::with_capacity(contexts.len());
        for context in contexts {
            if let Ok(project) = context.project().await {
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Deletes the project row (cascading every owned row), the on-disk
    /// state dir, and the registry entry.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        let (record, context) = {
            let mut inner = self.inner.write().await;
            inner
                .remove(project_id)
                .ok_or_else(|| ForemanError::NotFound(format!("project {project_id}")))?
        };
        context.store.delete_project_rows().await?;
        context.abort_background();
        let state_dir = PathBuf::from(&record.root).join(".foreman");
        if state_dir.exists() {
            let _ = fs::remove_dir_all(&state_dir).await;
        }
        self.flush().await?;
        self.global_bus.publish(
            WorkflowEvent::new(
                EventKind::ProjectDeleted,
                project_id.to_string(),
                json!({"projectId": project_id, "name": record.name}),
            )
            .with_entity(format!("project:{project_id}"), None),
        );
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let records: Vec<ProjectRecord> = {
            let inner = self.inner.read().await;
            inner.values().map(|(record, _)| record.clone()).collect()
        };
        let path = self.state_dir.join("projects.json");
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&records)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn create_list_delete_project() {
        let state = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let registry = ProjectRegistry::load(state.path()).await.unwrap();

        let project = registry
            .create_project("demo", &workdir.path().join("demo"), None)
            .await
            .unwrap();
        assert_eq!(project.name, "demo");
        assert_eq!(project.current_phase, Phase::Planner);

        // Duplicate names conflict.
        let err = registry
            .create_project("demo", &workdir.path().join("demo2"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        let listed = registry.list_projects().await;
        assert_eq!(listed.len(), 1);

        registry.delete_project(&project.id).await.unwrap();
        assert!(registry.context(&project.id).await.is_err());
        assert!(registry.list_projects().await.is_empty());
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let state = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        {
            let registry = ProjectRegistry::load(state.path()).await.unwrap();
            registry
                .create_project("persisted", &workdir.path().join("p"), None)
                .await
                .unwrap();
        }
        let registry = ProjectRegistry::load(state.path()).await.unwrap();
        let listed = registry.list_projects().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "persisted");
    }

    #[tokio::test]
    async fn project_events_flow_to_audit_rows() {
        let state = TempDir::new().unwrap();
        let workdir = TempDir::new().unwrap();
        let registry = ProjectRegistry::load(state.path()).await.unwrap();
        let project = registry
            .create_project("audited", &workdir.path().join("a"), None)
            .await
            .unwrap();
        let context = registry.context(&project.id).await.unwrap();

        context
            .governance
            .create_task(
                &foreman_types::TaskSpec {
                    title: "Audit me".into(),
                    ..Default::default()
                },
                Phase::Planner,
            )
            .await
            .unwrap();

        // The audit writer persists asynchronously.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let events = context.store.events_since(0, 100).await.unwrap();
        assert!(events
            .iter()
            .any(|event| event.kind == EventKind::TaskCreated));
    }
}
