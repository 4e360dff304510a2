use serde::{Deserialize, Serialize};

/// How a gate's sandbox result is judged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassCriteria {
    /// Some configurations write `exit_code_0`; both spell the same check.
    #[default]
    #[serde(alias = "exit_code_0")]
    ExitCodeZero,
    OutputContains,
    OutputMatches,
}

/// A named quality check the coder phase must pass before committing.
/// Accepts the shorthand keys (`cmd`, `pass`, `timeout`) seen in hand
/// written gate configs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    #[serde(alias = "cmd")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "pass")]
    pub pass_criteria: PassCriteria,
    /// Literal or regex, depending on the criteria.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Match `expected` against stderr instead of stdout.
    #[serde(default)]
    pub match_stderr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReport {
    pub total: usize,
    pub passed: usize,
    pub all_passed: bool,
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn from_results(results: Vec<GateResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.passed).count();
        Self {
            total,
            passed,
            all_passed: passed == total,
            results,
        }
    }

    /// Trailer fragment for commit messages, e.g. `2/2 passed`.
    pub fn summary_line(&self) -> String {
        format!("{}/{} passed", self.passed, self.total)
    }
}
