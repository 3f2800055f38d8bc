//! Manifest checks: `foreman validate` and `foreman waves`.

use anyhow::{Context, Result};
use foreman::WorkersManifest;
use foreman::dag::Schedule;
use std::path::Path;

fn resolve(manifest_path: &Path) -> Result<(WorkersManifest, Schedule)> {
    let manifest = WorkersManifest::load(manifest_path)?;
    let schedule = Schedule::resolve(manifest.workers.clone())?;
    Ok((manifest, schedule))
}

pub fn cmd_validate(manifest_path: &Path) -> Result<()> {
    let (manifest, schedule) = resolve(manifest_path)?;

    println!();
    println!(
        "{} {}",
        console::style("Manifest valid:").green().bold(),
        manifest_path.display()
    );
    println!("Project: {}", manifest.slug());
    println!(
        "{} worker(s) in {} wave(s)",
        schedule.worker_count(),
        schedule.waves().len()
    );

    let unbudgeted: Vec<&str> = manifest
        .workers
        .iter()
        .filter(|w| !w.token_budget.is_declared())
        .map(|w| w.id.as_str())
        .collect();
    if !unbudgeted.is_empty() {
        println!(
            "{} no token budget for: {}",
            console::style("note:").dim(),
            unbudgeted.join(", ")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_waves(manifest_path: &Path, json: bool) -> Result<()> {
    let (_, schedule) = resolve(manifest_path)?;

    if json {
        let out = serde_json::to_string_pretty(schedule.waves())
            .context("Failed to serialize waves")?;
        println!("{}", out);
    } else {
        print!("{}", schedule.summary());
    }
    Ok(())
}
