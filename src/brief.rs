//! Worker briefs: the instructions handed to each assistant at launch.

use crate::signals::COMPLETE_MARKER;
use crate::worker::WorkerSpec;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Render the brief for `spec`.
///
/// Marker tags are only ever mentioned inline, so an assistant echoing its
/// brief cannot be mistaken for a finished or failed worker.
pub fn render(spec: &WorkerSpec, project: Option<&str>, branch: &str) -> String {
    let mut out = String::new();

    let project = project
        .map(|p| format!(" on project {p}"))
        .unwrap_or_default();
    out.push_str(&format!(
        "# Worker brief: {}\n\nYou are the `{}` worker{}, working alone on branch `{}` in your own worktree.\n\n",
        spec.id, spec.role, project, branch
    ));

    if let Some(description) = spec.description.as_deref()
        && !description.trim().is_empty()
    {
        out.push_str("## TASK\n");
        out.push_str(description.trim());
        out.push_str("\n\n");
    }

    if !spec.deliverables.is_empty() {
        out.push_str("## DELIVERABLES\nThese paths must exist when you finish:\n");
        for path in &spec.deliverables {
            out.push_str(&format!("- {}\n", path.display()));
        }
        out.push('\n');
    }

    out.push_str("## SCOPE\n");
    if spec.owned_paths.is_empty() {
        out.push_str("No paths are assigned to you. Ask before editing any file.\n\n");
    } else {
        out.push_str("You own these paths. Edits elsewhere need an operator's approval:\n");
        for pattern in &spec.owned_paths {
            out.push_str(&format!("- {}\n", pattern));
        }
        out.push('\n');
    }

    if !spec.dependencies.is_empty() {
        out.push_str(&format!(
            "Work from {} is already merged into your branch's base.\n\n",
            spec.dependencies.join(", ")
        ));
    }

    if spec.token_budget.is_declared() {
        out.push_str(&format!(
            "Expected effort: {} to {} tokens.\n\n",
            spec.token_budget.low, spec.token_budget.high
        ));
    }

    out.push_str(&format!(
        r#"## RULES
1. Stay inside your scope
2. Commit your work to your branch with git as you go
3. Never push, and never force anything
4. Run the relevant tests before finishing
5. When everything is committed and verified, print the tag {} alone on its own line
6. If you cannot continue, print the reason wrapped in worker-fatal tags alone on its own line, for example: <worker-fatal>missing database schema</worker-fatal>
"#,
        COMPLETE_MARKER
    ));

    out
}

/// Write the brief for `spec` to `<briefs_dir>/<id>.md`.
pub fn write(
    briefs_dir: &Path,
    spec: &WorkerSpec,
    project: Option<&str>,
    branch: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(briefs_dir)
        .with_context(|| format!("Failed to create {}", briefs_dir.display()))?;
    let path = briefs_dir.join(format!("{}.md", spec.id));
    fs::write(&path, render(spec, project, branch))
        .with_context(|| format!("Failed to write brief {}", path.display()))?;
    Ok(path)
}
