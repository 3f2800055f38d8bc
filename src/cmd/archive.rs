//! Sealed phase inspection: `foreman archive`.

use anyhow::{Context, Result};
use console::style;
use foreman::audit::{FsArchiveStore, PhaseArchive};
use foreman::config::ForemanConfig;
use foreman::lifecycle::WorkerState;
use std::path::Path;

use super::super::ArchiveCommands;

pub fn cmd_archive(project_dir: &Path, command: Option<ArchiveCommands>) -> Result<()> {
    let config = ForemanConfig::new(project_dir.to_path_buf())?;
    let store = FsArchiveStore::new(&config.archive_dir());

    match command {
        None | Some(ArchiveCommands::List) => {
            let archives = store.list()?;
            if archives.is_empty() {
                println!("No sealed phases in {}", store.phases_dir().display());
                return Ok(());
            }
            println!();
            for path in archives {
                let archive = store.load(&path)?;
                let outcome = if archive.is_fully_successful() {
                    style("success").green()
                } else {
                    style("partial").yellow()
                };
                println!(
                    "  phase {:<4} {}  {}  {}/{} complete  {}",
                    archive.phase,
                    archive.sealed_at.format("%Y-%m-%d %H:%M"),
                    outcome,
                    archive.count_in(WorkerState::Complete),
                    archive.workers.len(),
                    style(path.display()).dim()
                );
            }
            println!();
        }
        Some(ArchiveCommands::Show { phase, json }) => {
            let Some((path, archive)) = store.find(phase)? else {
                match phase {
                    Some(n) => anyhow::bail!("No sealed phase {}", n),
                    None => anyhow::bail!("No sealed phases"),
                }
            };
            if json {
                let out = serde_json::to_string_pretty(&archive)
                    .context("Failed to serialize phase archive")?;
                println!("{}", out);
            } else {
                print_archive(&path, &archive);
            }
        }
    }

    Ok(())
}

fn print_archive(path: &Path, archive: &PhaseArchive) {
    println!();
    println!("Phase {} ({:?})", archive.phase, archive.close_mode);
    println!("=========");
    if let Some(ref project) = archive.project {
        println!("Project:  {}", project);
    }
    println!("Started:  {}", archive.started_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Sealed:   {}", archive.sealed_at.format("%Y-%m-%d %H:%M:%S"));
    println!("File:     {}", path.display());
    println!();

    println!("Workers:");
    for record in &archive.workers {
        let state = match record.final_state {
            WorkerState::Complete => style(record.final_state.to_string()).green(),
            WorkerState::Failed => style(record.final_state.to_string()).red(),
            _ => style(record.final_state.to_string()).yellow(),
        };
        let budget = if record.tokens.estimate.is_declared() {
            format!(
                " of {}-{}",
                record.tokens.estimate.low, record.tokens.estimate.high
            )
        } else {
            String::new()
        };
        let over = if record.tokens.over_budget() {
            style(" over budget").red().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<20} {:<10} tokens {}{}{}",
            record.spec.id, state, record.tokens.actual, budget, over
        );
        if let Some(ref failure) = record.failure {
            println!("    {}", style(failure).dim());
        }
    }
    println!();

    println!(
        "Approvals: {}  Escalations: {}  Operator actions: {}",
        archive.approvals.len(),
        archive.escalations.len(),
        archive.operator_actions.len()
    );
    for escalation in &archive.escalations {
        println!(
            "  [{}] {}: {}",
            escalation.kind,
            escalation.worker_id.as_deref().unwrap_or("phase"),
            escalation.message
        );
    }
    println!();

    match archive.integration {
        Some(ref report) => println!("{}", report.summary()),
        None => println!("Integration did not run"),
    }
    println!();
}
