use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;

use foreman_engines::EngineConfig;
use foreman_sandbox::SandboxPolicy;
use foreman_types::{ForemanError, Result};

pub const CONFIG_FILE: &str = "foreman.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default per-gate timeout in seconds when the gate spec has none.
    #[serde(default = "default_gate_timeout")]
    pub timeout: u64,
    /// Short-circuit on the first failing gate.
    #[serde(default)]
    pub fail_on_error: bool,
}

fn default_true() -> bool {
    true
}

fn default_gate_timeout() -> u64 {
    300
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: default_gate_timeout(),
            fail_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseKind {
    #[default]
    #[serde(rename = "embedded-sqlite")]
    EmbeddedSqlite,
    #[serde(rename = "postgres")]
    Postgres,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default)]
    pub kind: DatabaseKind,
    /// Backend-specific connection parameters.
    #[serde(flatten)]
    pub params: HashMap<String, Value>,
}

/// Per-project configuration, stored as `foreman.json` at the project
/// root. Missing file means defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_engine: Option<String>,
    #[serde(default = "default_sandbox")]
    pub sandbox: SandboxPolicy,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub engines: HashMap<String, EngineConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Projects always get `git` for the VCS adapter; everything else is
/// opt-in.
fn default_sandbox() -> SandboxPolicy {
    SandboxPolicy {
        allowed_commands: vec!["git".to_string()],
        ..SandboxPolicy::default()
    }
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_name: None,
            default_engine: None,
            sandbox: default_sandbox(),
            gates: GatesConfig::default(),
            engines: HashMap::new(),
            database: DatabaseConfig::default(),
        }
    }
}

impl ProjectConfig {
    pub async fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path)
            .await
            .map_err(|err| ForemanError::Storage(format!("read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| ForemanError::Validation(format!("{CONFIG_FILE}: {err}")))
    }

    pub async fn save(&self, project_root: &Path) -> Result<()> {
        let path = project_root.join(CONFIG_FILE);
        let raw = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// The config model recognizes the postgres variant, but this build
    /// only ships the embedded backend.
    pub fn validate(&self) -> Result<()> {
        if self.database.kind == DatabaseKind::Postgres {
            return Err(ForemanError::Validation(
                "database.type = postgres is not compiled into this build".to_string(),
            ));
        }
        Ok(())
    }

    pub fn engines_config(&self) -> foreman_engines::EnginesConfig {
        foreman_engines::EnginesConfig {
            engines: self.engines.clone(),
            default_engine: self.default_engine.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ProjectConfig::load(dir.path()).await.unwrap();
        assert!(config.gates.enabled);
        assert_eq!(config.gates.timeout, 300);
        assert_eq!(config.sandbox.allowed_commands, vec!["git".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let mut config = ProjectConfig::default();
        config.project_name = Some("demo".into());
        config.sandbox.allowed_commands = vec!["git".into(), "cargo".into()];
        config.save(dir.path()).await.unwrap();

        let loaded = ProjectConfig::load(dir.path()).await.unwrap();
        assert_eq!(loaded.project_name.as_deref(), Some("demo"));
        assert_eq!(loaded.sandbox.allowed_commands.len(), 2);
    }

    #[tokio::test]
    async fn recognized_options_parse_from_json() {
        let dir = TempDir::new().unwrap();
        let raw = serde_json::json!({
            "project_name": "demo",
            "default_engine": "claude",
            "sandbox": {
                "allowed_paths": ["src/**"],
                "blocked_paths": ["src/secrets/**"],
                "allowed_commands": ["cargo", "git"],
                "blocked_commands": ["rm"],
                "command_timeout": 90
            },
            "gates": {"enabled": true, "timeout": 120, "fail_on_error": true},
            "database": {"type": "embedded-sqlite"}
        });
        std::fs::write(dir.path().join(CONFIG_FILE), raw.to_string()).unwrap();
        let config = ProjectConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.default_engine.as_deref(), Some("claude"));
        assert_eq!(config.sandbox.command_timeout, 90);
        assert!(config.gates.fail_on_error);
        assert!(!config.sandbox.command_allowed("rm"));
    }

    #[tokio::test]
    async fn postgres_is_recognized_but_rejected() {
        let dir = TempDir::new().unwrap();
        let raw = serde_json::json!({
            "database": {"type": "postgres", "host": "db.internal", "port": 5432}
        });
        std::fs::write(dir.path().join(CONFIG_FILE), raw.to_string()).unwrap();
        let config = ProjectConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.database.kind, DatabaseKind::Postgres);
        assert_eq!(config.validate().unwrap_err().code(), "validation");
    }
}
