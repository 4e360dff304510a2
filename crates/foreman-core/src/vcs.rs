use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;

use foreman_sandbox::{CommandSpec, Sandbox};
use foreman_types::{EventKind, ForemanError, Result, WorkflowEvent};

use crate::event_bus::EventBus;

#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    pub branch: String,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub has_changes: bool,
}

/// Drives the external `git` binary through the sandbox. Commits stage the
/// exact file set and return the new revision; on failure the working tree
/// is left as git left it.
#[derive(Clone)]
pub struct GitAdapter {
    project_id: String,
    sandbox: Sandbox,
    bus: Option<EventBus>,
}

impl GitAdapter {
    pub fn new(project_id: impl Into<String>, sandbox: Sandbox) -> Self {
        Self {
            project_id: project_id.into(),
            sandbox,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    async fn git(&self, root: &Path, args: &[&str]) -> Result<foreman_sandbox::CommandOutcome> {
        let mut spec = CommandSpec::new(
            "git",
            args.iter().map(|a| a.to_string()).collect(),
            root.to_path_buf(),
        );
        spec.timeout = Duration::from_secs(self.sandbox.policy().command_timeout);
        let outcome = self.sandbox.run(spec).await?;
        if outcome.timed_out {
            return Err(ForemanError::Timeout(format!(
                "git {} timed out",
                args.join(" ")
            )));
        }
        Ok(outcome)
    }

    pub async fn is_repo(&self, root: &Path) -> Result<bool> {
        let outcome = self
            .git(root, &["rev-parse", "--is-inside-work-tree"])
            .await?;
        Ok(outcome.exit_code == 0 && outcome.stdout.trim() == "true")
    }

    pub async fn init(&self, root: &Path) -> Result<()> {
        let outcome = self.git(root, &["init"]).await?;
        if outcome.exit_code != 0 {
            return Err(ForemanError::Storage(format!(
                "git init failed: {}",
                outcome.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn status(&self, root: &Path) -> Result<RepoStatus> {
        let branch = self
            .git(root, &["branch", "--show-current"])
            .await?
            .stdout
            .trim()
            .to_string();
        let porcelain = self.git(root, &["status", "--porcelain"]).await?;
        if porcelain.exit_code != 0 {
            return Err(ForemanError::Storage(format!(
                "git status failed: {}",
                porcelain.stderr.trim()
            )));
        }
        let mut staged = Vec::new();
        let mut unstaged = Vec::new();
        for line in porcelain.stdout.lines() {
            if line.len() < 4 {
                continue;
            }
            let index = line.as_bytes()[0] as char;
            let worktree = line.as_bytes()[1] as char;
            let path = line[3..].to_string();
            if index != ' ' && index != '?' {
                staged.push(path.clone());
            }
            if worktree != ' ' || index == '?' {
                unstaged.push(path);
            }
        }
        let has_changes = !staged.is_empty() || !unstaged.is_empty();
        Ok(RepoStatus {
            branch,
            staged,
            unstaged,
            has_changes,
        })
    }

    /// Stage exactly `files`, commit, and return the new revision id.
    pub async fn commit(&self, root: &Path, files: &[PathBuf], message: &str) -> Result<String> {
        let mut add_args = vec!["add".to_string(), "--".to_string()];
        for file in files {
            add_args.push(file.display().to_string());
        }
        let add_args_ref: Vec<&str> = add_args.iter().map(String::as_str).collect();
        let added = self.git(root, &add_args_ref).await?;
        if added.exit_code != 0 {
            return Err(ForemanError::Storage(format!(
                "git add failed: {}",
                added.stderr.trim()
            )));
        }

        let committed = self.git(root, &["commit", "-m", message]).await?;
        if committed.exit_code != 0 {
            return Err(ForemanError::Storage(format!(
                "git commit failed: {}",
                committed.stderr.trim()
            )));
        }

        let sha = self
            .git(root, &["rev-parse", "HEAD"])
            .await?
            .stdout
            .trim()
            .to_string();
        if sha.is_empty() {
            return Err(ForemanError::Storage("git rev-parse returned no sha".into()));
        }
        if let Some(bus) = &self.bus {
            bus.publish(WorkflowEvent::new(
                EventKind::VcsCommitted,
                self.project_id.clone(),
                json!({"sha": sha, "files": files.len(), "message": message.lines().next()}),
            ));
        }
        Ok(sha)
    }

    pub async fn diff(&self, root: &Path) -> Result<String> {
        let outcome = self.git(root, &["diff"]).await?;
        Ok(outcome.stdout)
    }
}
