use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Dependency-aware multi-worker orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a workers manifest: ids, dependencies, budgets, cycles
    Validate {
        /// Manifest file (.json, .yaml or .yml)
        manifest: PathBuf,
    },
    /// Print the execution waves for a manifest
    Waves {
        manifest: PathBuf,

        /// Print waves as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one phase: launch workers wave by wave, supervise, integrate, archive
    Run {
        /// Manifest file; omit with --carry-over
        manifest: Option<PathBuf>,

        /// Re-run the workers the latest archived phase left unfinished
        #[arg(long)]
        carry_over: bool,

        /// Workers allowed to run at once
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Branch worker branches are merged into
        #[arg(long)]
        target_branch: Option<String>,

        /// Escalate every prompt instead of auto-approving
        #[arg(long)]
        no_auto_approve: bool,

        /// tmux session name (defaults to the project slug)
        #[arg(long)]
        session: Option<String>,
    },
    /// Inspect sealed phases
    Archive {
        #[command(subcommand)]
        command: Option<ArchiveCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ArchiveCommands {
    /// List sealed phases, newest first
    List,
    /// Show one sealed phase (latest by default)
    Show {
        phase: Option<u32>,

        /// Print the raw archive JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default .foreman/foreman.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Validate { manifest } => cmd::cmd_validate(manifest)?,
        Commands::Waves { manifest, json } => cmd::cmd_waves(manifest, *json)?,
        Commands::Run {
            manifest,
            carry_over,
            max_concurrent,
            target_branch,
            no_auto_approve,
            session,
        } => {
            let options = cmd::RunOptions {
                manifest: manifest.clone(),
                carry_over: *carry_over,
                max_concurrent: *max_concurrent,
                target_branch: target_branch.clone(),
                no_auto_approve: *no_auto_approve,
                session: session.clone(),
            };
            cmd::cmd_run(&cli, project_dir, options).await?;
        }
        Commands::Archive { command } => cmd::cmd_archive(&project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
