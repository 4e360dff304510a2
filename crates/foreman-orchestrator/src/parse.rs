use serde::{Deserialize, Serialize};

use foreman_types::{ForemanError, GateSpec, Result};

/// Structured planner output: `plan.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPayload {
    #[serde(default)]
    pub metadata: PlanMetadata,
    pub tasks: Vec<PlanTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Zero-based indices into `tasks`; forward references are dropped.
    #[serde(default)]
    pub dependencies: Vec<usize>,
}

/// Structured architect output: `architecture.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitecturePayload {
    #[serde(default)]
    pub options: Vec<ArchitectureOption>,
    #[serde(default)]
    pub adrs: Vec<AdrDocument>,
    #[serde(default)]
    pub task_refinements: Vec<TaskRefinement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchitectureOption {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    #[serde(default)]
    pub trade_offs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdrDocument {
    pub name: String,
    pub markdown: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRefinement {
    pub task_id: i64,
    #[serde(default)]
    pub deps: Vec<i64>,
    #[serde(default)]
    pub gates: Vec<GateSpec>,
    #[serde(default)]
    pub priority: Option<i64>,
}

/// Engine output decoded as far as structure allows. Never panics on
/// malformed input; the worst case is `Freeform`.
#[derive(Debug, Clone)]
pub enum ParsedEngineOutput {
    Plan(PlanPayload),
    Architecture(ArchitecturePayload),
    Freeform(String),
}

pub fn parse_engine_output(output: &str) -> ParsedEngineOutput {
    for candidate in json_candidates(output) {
        if let Ok(plan) = serde_json::from_str::<PlanPayload>(&candidate) {
            return ParsedEngineOutput::Plan(plan);
        }
        if let Ok(architecture) = serde_json::from_str::<ArchitecturePayload>(&candidate) {
            if !architecture.options.is_empty() || !architecture.adrs.is_empty() {
                return ParsedEngineOutput::Architecture(architecture);
            }
        }
    }
    ParsedEngineOutput::Freeform(output.to_string())
}

/// Planner transcripts tolerate leading/trailing chatter; absence of a
/// parseable block is a `Parse` failure with error `plan_parse`.
pub fn parse_plan(output: &str) -> Result<PlanPayload> {
    for candidate in json_candidates(output) {
        if let Ok(plan) = serde_json::from_str::<PlanPayload>(&candidate) {
            return Ok(plan);
        }
    }
    Err(ForemanError::Parse("plan_parse".to_string()))
}

pub fn parse_architecture(output: &str) -> Result<ArchitecturePayload> {
    for candidate in json_candidates(output) {
        if let Ok(architecture) = serde_json::from_str::<ArchitecturePayload>(&candidate) {
            if !architecture.options.is_empty()
                || !architecture.adrs.is_empty()
                || !architecture.task_refinements.is_empty()
            {
                return Ok(architecture);
            }
        }
    }
    Err(ForemanError::Parse("architecture_parse".to_string()))
}

/// Candidate JSON blocks in preference order: fenced code blocks first,
/// then the largest balanced top-level object in the raw text.
fn json_candidates(output: &str) -> Vec<String> {
    let mut out = Vec::new();

    for marker in ["```json", "```JSON", "```"] {
        if let Some(start) = output.find(marker) {
            let after = &output[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    out.push(block.to_string());
                }
            }
        }
    }

    if let Some(block) = largest_balanced_object(output) {
        out.push(block);
    }

    out
}

/// Longest `{...}` span with balanced braces, ignoring braces inside JSON
/// string literals.
fn largest_balanced_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut best: Option<(usize, usize)> = None;
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, &byte) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(idx),
            b'}' => {
                if let Some(start) = stack.pop() {
                    if stack.is_empty() {
                        let span = (start, idx + 1);
                        if best.map(|(s, e)| span.1 - span.0 > e - s).unwrap_or(true) {
                            best = Some(span);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(start, end)| text[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN_JSON: &str = r#"{
        "metadata": {"generated_at": "2025-01-01T00:00:00Z", "engine": "static"},
        "tasks": [
            {"title": "Implement add", "description": "a+b", "priority": 2},
            {"title": "Unit test add", "dependencies": [0]}
        ]
    }"#;

    #[test]
    fn plan_parses_with_surrounding_chatter() {
        let output = format!(
            "Sure, here is the plan you asked for.\n\n{PLAN_JSON}\n\nLet me know if it fits."
        );
        let plan = parse_plan(&output).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].title, "Implement add");
        assert_eq!(plan.tasks[1].dependencies, vec![0]);
    }

    #[test]
    fn plan_parses_from_fenced_block() {
        let output = format!("```json\n{PLAN_JSON}\n```");
        let plan = parse_plan(&output).unwrap();
        assert_eq!(plan.metadata.engine.as_deref(), Some("static"));
    }

    #[test]
    fn missing_json_is_a_parse_failure() {
        let err = parse_plan("I could not produce a plan, sorry.").unwrap_err();
        assert_eq!(err.code(), "parse");
        assert!(err.to_string().contains("plan_parse"));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let output = r#"note: "{ not json" then {"metadata":{},"tasks":[{"title":"T { tricky }"}]} done"#;
        let plan = parse_plan(output).unwrap();
        assert_eq!(plan.tasks[0].title, "T { tricky }");
    }

    #[test]
    fn largest_object_wins_over_smaller_ones() {
        let output = r#"{"a":1} {"metadata":{},"tasks":[{"title":"big"},{"title":"ger"}]}"#;
        let plan = parse_plan(output).unwrap();
        assert_eq!(plan.tasks.len(), 2);
    }

    #[test]
    fn architecture_block_parses() {
        let output = r##"Here you go:
        {"options":[{"id":"opt-1","name":"Modular monolith","pros":["simple"],"cons":["scaling"],"trade_offs":"fewer moving parts"}],
         "adrs":[{"name":"adr-001-storage","markdown":"# Storage\nUse sqlite."}],
         "task_refinements":[{"task_id":1,"deps":[],"priority":3}]}"##;
        let architecture = parse_architecture(output).unwrap();
        assert_eq!(architecture.options.len(), 1);
        assert_eq!(architecture.adrs[0].name, "adr-001-storage");
        assert_eq!(architecture.task_refinements[0].task_id, 1);
    }

    #[test]
    fn tagged_union_falls_back_to_freeform() {
        match parse_engine_output("just prose") {
            ParsedEngineOutput::Freeform(text) => assert_eq!(text, "just prose"),
            other => panic!("expected freeform, got {other:?}"),
        }
    }
}
