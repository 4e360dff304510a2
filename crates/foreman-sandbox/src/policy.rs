use serde::{Deserialize, Serialize};
use std::path::Path;

/// Allow/deny rules for one project. Paths are glob patterns relative to
/// the project root; commands are basenames. Deny always overrides allow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    #[serde(default = "default_allowed_paths")]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_env_allowlist")]
    pub env_allowlist: Vec<String>,
}

fn default_allowed_paths() -> Vec<String> {
    vec!["**".to_string()]
}

fn default_command_timeout() -> u64 {
    120
}

fn default_env_allowlist() -> Vec<String> {
    ["PATH", "HOME", "LANG", "TERM"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_paths: default_allowed_paths(),
            blocked_paths: Vec::new(),
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            command_timeout: default_command_timeout(),
            env_allowlist: default_env_allowlist(),
        }
    }
}

impl SandboxPolicy {
    /// Commands run only when the basename is allowlisted and not blocked.
    pub fn command_allowed(&self, command: &str) -> bool {
        let base = Path::new(command)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(command);
        if self
            .blocked_commands
            .iter()
            .any(|blocked| blocked == base)
        {
            return false;
        }
        self.allowed_commands.iter().any(|allowed| allowed == base)
    }

    /// Matches a project-relative path against the allow globs, with block
    /// globs overriding.
    pub fn path_allowed(&self, relative: &str) -> bool {
        let matches = |pattern: &str| {
            glob::Pattern::new(pattern)
                .map(|p| {
                    p.matches_with(
                        relative,
                        glob::MatchOptions {
                            case_sensitive: true,
                            require_literal_separator: false,
                            require_literal_leading_dot: false,
                        },
                    )
                })
                .unwrap_or(false)
        };
        if self.blocked_paths.iter().any(|pattern| matches(pattern)) {
            return false;
        }
        // The project root itself is always reachable.
        if relative.is_empty() {
            return true;
        }
        self.allowed_paths.iter().any(|pattern| matches(pattern))
    }
}
