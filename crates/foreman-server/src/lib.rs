use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use foreman_core::ProjectRegistry;
use foreman_orchestrator::PhaseOrchestrator;
use foreman_types::Result;

mod http;

pub use http::{app_router, serve};

/// Shared server state: the project registry plus one orchestrator per
/// open project (cancellation handles must survive across requests).
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProjectRegistry>,
    orchestrators: Arc<RwLock<HashMap<String, PhaseOrchestrator>>>,
}

impl AppState {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        Self {
            registry,
            orchestrators: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn orchestrator(&self, project_id: &str) -> Result<PhaseOrchestrator> {
        {
            let orchestrators = self.orchestrators.read().await;
            if let Some(orchestrator) = orchestrators.get(project_id) {
                return Ok(orchestrator.clone());
            }
        }
        let ctx = self.registry.context(project_id).await?;
        let orchestrator = PhaseOrchestrator::new(ctx);
        self.orchestrators
            .write()
            .await
            .insert(project_id.to_string(), orchestrator.clone());
        Ok(orchestrator)
    }

    pub async fn forget_project(&self, project_id: &str) {
        self.orchestrators.write().await.remove(project_id);
    }

    pub async fn context(
        &self,
        project_id: &str,
    ) -> Result<Arc<foreman_core::ProjectContext>> {
        self.registry.context(project_id).await
    }
}
