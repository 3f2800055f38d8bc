//! Phase execution: `foreman run`.
//!
//! While a phase runs, stdin accepts operator commands:
//! `respond <worker> <text>`, `cancel <worker>`, `status`, and `close`.

use anyhow::{Result, bail};
use console::style;
use foreman::adapters::{GitWorkspace, LogEscalationChannel, TmuxProcess};
use foreman::audit::{FsArchiveStore, PhaseArchive};
use foreman::config::ForemanConfig;
use foreman::lifecycle::WorkerState;
use foreman::errors::OrchestratorError;
use foreman::integration::IntegrationReport;
use foreman::orchestrator::{Collaborators, Orchestrator, PhaseEvent, PhaseRun};
use foreman::{SealedPhase, WorkerSpec, WorkersManifest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::super::Cli;

type DriveResult = Result<Option<IntegrationReport>, OrchestratorError>;

/// How long a sealed phase's driver gets to notice and return.
const DRIVER_GRACE: Duration = Duration::from_secs(5);

pub struct RunOptions {
    pub manifest: Option<PathBuf>,
    pub carry_over: bool,
    pub max_concurrent: Option<usize>,
    pub target_branch: Option<String>,
    pub no_auto_approve: bool,
    pub session: Option<String>,
}

/// An operator command typed while the phase runs.
#[derive(Debug, PartialEq, Eq)]
enum OperatorCommand {
    Respond { worker: String, text: String },
    Cancel { worker: String },
    Status,
    Close,
}

fn parse_command(line: &str) -> Result<Option<OperatorCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match verb {
        "respond" | "r" => {
            let Some((worker, text)) = rest.split_once(char::is_whitespace) else {
                bail!("usage: respond <worker> <text>");
            };
            OperatorCommand::Respond {
                worker: worker.to_string(),
                text: text.trim().to_string(),
            }
        }
        "cancel" | "c" if !rest.is_empty() => OperatorCommand::Cancel {
            worker: rest.to_string(),
        },
        "cancel" | "c" => bail!("usage: cancel <worker>"),
        "status" | "s" => OperatorCommand::Status,
        "close" | "q" => OperatorCommand::Close,
        other => bail!("unknown command '{}' (respond, cancel, status, close)", other),
    };
    Ok(Some(command))
}

/// Specs and project slug for this run.
fn load_specs(
    options: &RunOptions,
    config: &ForemanConfig,
) -> Result<(Vec<WorkerSpec>, String)> {
    if options.carry_over {
        let store = FsArchiveStore::new(&config.archive_dir());
        let Some((path, archive)) = store.find(None)? else {
            bail!("No archived phase to carry over from");
        };
        let specs = archive.outstanding_specs();
        if specs.is_empty() {
            bail!(
                "Phase {} ({}) has no unfinished workers",
                archive.phase,
                path.display()
            );
        }
        let project = archive.project.clone().unwrap_or_else(|| "foreman".to_string());
        println!(
            "Carrying over {} worker(s) from phase {}",
            specs.len(),
            archive.phase
        );
        return Ok((specs, project));
    }

    let Some(ref manifest_path) = options.manifest else {
        bail!("A manifest is required unless --carry-over is given");
    };
    let manifest = WorkersManifest::load(manifest_path)?;
    let project = manifest.slug();
    Ok((manifest.workers, project))
}

pub async fn cmd_run(cli: &Cli, project_dir: PathBuf, options: RunOptions) -> Result<()> {
    let config = ForemanConfig::new(project_dir)?.with_cli_overrides(
        options.max_concurrent,
        options.target_branch.clone(),
        options.no_auto_approve,
        cli.verbose,
    );
    config.ensure_directories()?;
    let _guard = foreman::logging::init(&config.toml.logging, cli.verbose, &config.log_dir())?;

    for warning in config.validate() {
        println!("{} {}", style("warning:").yellow().bold(), warning);
    }

    let (specs, project) = load_specs(&options, &config)?;
    let session = options
        .session
        .clone()
        .or_else(|| config.toml.tmux.session.clone())
        .unwrap_or_else(|| project.clone());

    let git = Arc::new(GitWorkspace::new(
        &config.project_dir,
        &config.toml.orchestrator.target_branch,
    ));
    let tmux = Arc::new(
        TmuxProcess::new(&config, &session, Some(project.clone()), git.clone()).with_workers(&specs),
    );
    let collaborators = Collaborators {
        process: tmux.clone(),
        output: tmux,
        vcs: git,
        archive: Arc::new(FsArchiveStore::new(&config.archive_dir())),
        escalation: Arc::new(LogEscalationChannel::new(Some(config.escalations_log()))),
    };

    let (tx, mut rx) = mpsc::channel::<PhaseEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let mut orchestrator = Orchestrator::new(config, collaborators).with_event_channel(tx);
    let run = orchestrator.prepare(specs, Some(project)).await?;

    println!();
    println!(
        "{} phase {} in tmux session '{}'",
        style("Starting").green().bold(),
        run.phase(),
        session
    );
    print!("{}", run.schedule().summary());
    println!("Commands: respond <worker> <text> | cancel <worker> | status | close");
    println!();

    let driver = supervise(run).await;

    let sealed = orchestrator.close_phase().await?;
    if let Some(mut driver) = driver {
        // Sealing wakes the driver; one idle on a wave with nothing running is aborted
        if tokio::time::timeout(DRIVER_GRACE, &mut driver).await.is_err() {
            driver.abort();
        }
    }
    drop(orchestrator);
    // An interrupted driver task may still hold a sender
    tokio::time::timeout(Duration::from_secs(1), printer).await.ok();
    print_sealed(&sealed);
    Ok(())
}

/// Drive the phase while serving operator commands. Returns when the phase
/// finished integrating, the operator closed it, or Ctrl-C arrived. In the
/// last two cases the still-running driver task is handed back so it can be
/// reaped once the phase is sealed.
async fn supervise(run: Arc<PhaseRun>) -> Option<JoinHandle<DriveResult>> {
    let mut driver = tokio::spawn({
        let run = run.clone();
        async move { run.drive().await }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            result = &mut driver => {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => eprintln!("{} {:#}", style("error:").red().bold(), e),
                    Err(e) => eprintln!("{} phase driver panicked: {}", style("error:").red().bold(), e),
                }
                return None;
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if handle_line(&run, &line).await {
                            return Some(driver);
                        }
                    }
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", style("Interrupted, closing phase").yellow());
                return Some(driver);
            }
        }
    }
}

/// Returns true when the operator asked to close the phase.
async fn handle_line(run: &PhaseRun, line: &str) -> bool {
    let command = match parse_command(line) {
        Ok(Some(command)) => command,
        Ok(None) => return false,
        Err(e) => {
            println!("{} {}", style("?").yellow(), e);
            return false;
        }
    };

    let result = match command {
        OperatorCommand::Respond { worker, text } => run.respond(&worker, &text).await,
        OperatorCommand::Cancel { worker } => run.cancel(&worker).await,
        OperatorCommand::Status => {
            print_status(run).await;
            Ok(())
        }
        OperatorCommand::Close => return true,
    };
    if let Err(e) = result {
        println!("{} {}", style("error:").red().bold(), e);
    }
    false
}

async fn print_status(run: &PhaseRun) {
    for worker in run.state().lifecycle.snapshot_all().await {
        let state = match worker.state {
            WorkerState::Complete => style(worker.state.to_string()).green(),
            WorkerState::Failed => style(worker.state.to_string()).red(),
            WorkerState::Blocked => style(worker.state.to_string()).yellow(),
            _ => style(worker.state.to_string()).dim(),
        };
        let reason = worker
            .blocked_reason
            .as_ref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!(
            "  {:<20} {}{}  tokens: {}",
            worker.id(),
            state,
            reason,
            worker.tokens_consumed
        );
    }
}

fn print_event(event: &PhaseEvent) {
    match event {
        PhaseEvent::WaveStarted { wave, workers } => println!(
            "{} wave {}: {}",
            style("▶").cyan(),
            wave + 1,
            workers.join(", ")
        ),
        PhaseEvent::WorkerLaunched { worker } => {
            println!("  {} {}", style("launched").green(), worker)
        }
        PhaseEvent::LaunchFailed { worker, reason } => {
            println!("  {} {}: {}", style("failed").red(), worker, reason)
        }
        PhaseEvent::WaveSettled { wave } => {
            println!("{} wave {} settled", style("✓").green(), wave + 1)
        }
        PhaseEvent::IntegrationFinished { successful } => {
            if *successful {
                println!("{} integration clean", style("✓").green().bold());
            } else {
                println!("{} integration needs attention", style("!").yellow().bold());
            }
        }
    }
}

fn print_sealed(sealed: &SealedPhase) {
    let archive: &PhaseArchive = &sealed.archive;
    println!();
    println!(
        "Phase {} sealed: {} complete, {} failed, {} not started",
        archive.phase,
        archive.count_in(WorkerState::Complete),
        archive.count_in(WorkerState::Failed),
        archive.count_in(WorkerState::Pending) + archive.count_in(WorkerState::Ready)
    );
    if let Some(ref report) = archive.integration {
        println!("{}", report.summary());
    }
    if archive.is_fully_successful() {
        println!("{}", style("Phase fully successful").green().bold());
    } else {
        println!(
            "{}",
            style("Phase not fully successful; `foreman run --carry-over` re-runs unfinished workers")
                .yellow()
        );
    }
    println!("Archive: {}", sealed.location);
}
