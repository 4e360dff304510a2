use std::path::Path;

use foreman_core::ProjectContext;
use foreman_types::{ArtifactKind, Result, RunStatus, TaskVersion};

use crate::parse::ArchitecturePayload;

pub(crate) const PLANNER_INSTRUCTIONS: &str = "\
You are the planning engine of a governed software workflow. Read the \
specification below and answer with a single JSON object of the shape \
{\"metadata\": {\"generated_at\", \"engine\", \"note\"?}, \"tasks\": \
[{\"title\", \"description\", \"priority\"?, \"acceptance_criteria\"?, \
\"dependencies\"?}]}. Dependencies are zero-based indices of earlier tasks. \
Do not include any other JSON object in your answer.";

pub(crate) const ARCHITECT_INSTRUCTIONS: &str = "\
You are the architecture engine of a governed software workflow. Given the \
specification, the plan, and prior decision records, answer with a single \
JSON object of the shape {\"options\": [{\"id\", \"name\", \"description\", \
\"pros\", \"cons\", \"trade_offs\"}], \"adrs\": [{\"name\", \"markdown\"}], \
\"task_refinements\": [{\"task_id\", \"deps\", \"gates\", \"priority\"}]}.";

pub(crate) const CODER_SAFETY_RULES: &str = "\
## Safety rules
- Work only inside the project root; never read or write outside it.
- Run no commands; quality gates run separately after you finish.
- Keep the change minimal: implement exactly the task below.
- Do not rewrite history or touch version control state.";

/// How many files the selection heuristic lists for the coder bundle.
const MAX_CONTEXT_FILES: usize = 50;
/// How many previous failure diffs travel along.
const MAX_FAILURE_DIFFS: usize = 2;

/// Assembled context documents for one coder run.
pub(crate) struct ContextBundle {
    pub documents: Vec<String>,
    pub rendered: String,
}

pub(crate) fn render_task_brief(version: &TaskVersion) -> String {
    let mut out = format!(
        "## Task\nTitle: {}\n\n{}\n",
        version.title, version.description
    );
    if !version.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for criterion in &version.acceptance_criteria {
            out.push_str(&format!("- {criterion}\n"));
        }
    }
    out
}

/// Build the coder context: active version, selected architecture option,
/// previous failure diffs, safety rules, and a file listing heuristic.
pub(crate) async fn build_coder_bundle(
    ctx: &ProjectContext,
    version: &TaskVersion,
) -> Result<ContextBundle> {
    let mut documents = Vec::new();
    documents.push(render_task_brief(version));

    if let Some(option_text) = selected_option_text(ctx).await? {
        documents.push(option_text);
    }

    for diff in failure_diffs(ctx, version.task_id).await? {
        documents.push(format!("## Previous failed attempt (diff)\n{diff}"));
    }

    if let Some(report) = last_failed_gate_summary(ctx, version.task_id).await? {
        documents.push(report);
    }

    documents.push(CODER_SAFETY_RULES.to_string());
    documents.push(file_listing(&ctx.root));

    let rendered = documents.join("\n\n");
    Ok(ContextBundle {
        documents,
        rendered,
    })
}

async fn selected_option_text(ctx: &ProjectContext) -> Result<Option<String>> {
    let project = ctx.project().await?;
    let Some(option_id) = project.selected_architecture_option else {
        return Ok(None);
    };
    let architectures = ctx
        .store
        .list_artifacts(Some(ArtifactKind::Architecture))
        .await?;
    let Some(latest) = architectures.last() else {
        return Ok(None);
    };
    let bytes = ctx.artifacts.read(latest).await?;
    let payload: ArchitecturePayload = match serde_json::from_slice(&bytes) {
        Ok(payload) => payload,
        Err(_) => return Ok(None),
    };
    Ok(payload.options.into_iter().find(|o| o.id == option_id).map(|option| {
        format!(
            "## Selected architecture: {}\n{}\nTrade-offs: {}",
            option.name, option.description, option.trade_offs
        )
    }))
}

async fn failure_diffs(ctx: &ProjectContext, task_id: i64) -> Result<Vec<String>> {
    let diffs = ctx.store.list_artifacts(Some(ArtifactKind::Diff)).await?;
    let mut out = Vec::new();
    for meta in diffs
        .iter()
        .rev()
        .filter(|meta| meta.task_id == Some(task_id))
        .take(MAX_FAILURE_DIFFS)
    {
        if let Ok(bytes) = ctx.artifacts.read(meta).await {
            out.push(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    Ok(out)
}

async fn last_failed_gate_summary(ctx: &ProjectContext, task_id: i64) -> Result<Option<String>> {
    let runs = ctx.store.list_runs(Some(task_id)).await?;
    let Some(failed) = runs
        .iter()
        .rev()
        .find(|run| run.status == RunStatus::Failure && run.gate_report.is_some())
    else {
        return Ok(None);
    };
    let Some(report) = failed.gate_report.as_ref() else {
        return Ok(None);
    };
    let mut out = String::from("## Last gate results\n");
    for result in &report.results {
        out.push_str(&format!(
            "- {}: {} (exit {})\n",
            result.name,
            if result.passed { "passed" } else { "failed" },
            result.exit_code
        ));
        if !result.passed && !result.stderr.is_empty() {
            let tail: String = result
                .stderr
                .chars()
                .rev()
                .take(2000)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            out.push_str(&format!("  stderr: {tail}\n"));
        }
    }
    Ok(Some(out))
}

/// Shallow recursive listing skipping VCS and state directories. A cheap
/// heuristic, superseded by architecture hints when present.
fn file_listing(root: &Path) -> String {
    let mut files = Vec::new();
    collect_files(root, root, &mut files);
    files.sort();
    files.truncate(MAX_CONTEXT_FILES);
    let mut out = String::from("## Project files\n");
    for file in files {
        out.push_str(&format!("- {file}\n"));
    }
    out
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    if out.len() >= MAX_CONTEXT_FILES {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if out.len() >= MAX_CONTEXT_FILES {
            return;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == ".git" || name == ".foreman" || name == "target" || name == "node_modules" {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
}
