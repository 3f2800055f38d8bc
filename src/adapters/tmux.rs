//! tmux worker adapter: one window per worker, each in its own git worktree.

use super::git::GitWorkspace;
use crate::brief;
use crate::collaborators::{IsolationHandle, OutputSource, WorkerProcess};
use crate::config::ForemanConfig;
use crate::worker::WorkerSpec;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Window {
    worker: String,
    target: String,
    worktree: PathBuf,
}

pub struct TmuxProcess {
    session: String,
    agent_command: String,
    agent_args: Vec<String>,
    branch_prefix: String,
    project_dir: PathBuf,
    worktree_dir: PathBuf,
    briefs_dir: PathBuf,
    project: Option<String>,
    git: Arc<GitWorkspace>,
    /// Branch of every worker in the phase, by id
    branches: HashMap<String, String>,
    windows: Mutex<HashMap<IsolationHandle, Window>>,
}

impl TmuxProcess {
    pub fn new(
        config: &ForemanConfig,
        session: &str,
        project: Option<String>,
        git: Arc<GitWorkspace>,
    ) -> Self {
        Self {
            session: session.to_string(),
            agent_command: config.toml.tmux.agent_command.clone(),
            agent_args: config.toml.tmux.agent_args.clone(),
            branch_prefix: config.toml.orchestrator.branch_prefix.clone(),
            project_dir: config.project_dir.clone(),
            worktree_dir: config.worktree_dir(),
            briefs_dir: config.briefs_dir(),
            project,
            git,
            branches: HashMap::new(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record the phase's workers so dependents can start from their
    /// dependencies' branches.
    pub fn with_workers(mut self, specs: &[WorkerSpec]) -> Self {
        self.branches = specs
            .iter()
            .map(|spec| (spec.id.clone(), spec.branch_name(&self.branch_prefix)))
            .collect();
        self
    }

    fn dependency_branches(&self, spec: &WorkerSpec) -> Vec<String> {
        spec.dependencies
            .iter()
            .filter_map(|dep| self.branches.get(dep).cloned())
            .collect()
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    async fn ensure_session(&self) -> Result<()> {
        let exact = format!("={}", self.session);
        if tmux(&["has-session", "-t", &exact]).await.is_ok() {
            return Ok(());
        }
        let dir = self.project_dir.display().to_string();
        tmux(&["new-session", "-d", "-s", &self.session, "-c", &dir])
            .await
            .with_context(|| format!("Failed to create tmux session '{}'", self.session))?;
        info!(session = %self.session, "tmux session created");
        Ok(())
    }

    /// Arguments for the `new-window` call that launches `spec`'s assistant.
    fn new_window_args(&self, spec: &WorkerSpec, worktree: &Path, brief: &Path) -> Vec<String> {
        let mut args = vec![
            "new-window".to_string(),
            "-d".to_string(),
            "-P".to_string(),
            "-F".to_string(),
            "#{window_id}".to_string(),
            "-t".to_string(),
            format!("{}:", self.session),
            "-n".to_string(),
            spec.id.clone(),
            "-c".to_string(),
            worktree.display().to_string(),
            spec.agent.clone().unwrap_or_else(|| self.agent_command.clone()),
        ];
        args.extend(self.agent_args.iter().cloned());
        args.push(format!("Read {} and follow it.", brief.display()));
        args
    }

    async fn window(&self, handle: &IsolationHandle) -> Option<Window> {
        self.windows.lock().await.get(handle).cloned()
    }
}

/// Run tmux with `args` and return its stdout.
async fn tmux(args: &[&str]) -> Result<String> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .await
        .context("Failed to run tmux")?;
    if !output.status.success() {
        bail!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// tmux target for a handle of the form `session:@window`.
fn target_of(handle: &IsolationHandle) -> &str {
    handle.as_str()
}

#[async_trait]
impl WorkerProcess for TmuxProcess {
    async fn start(&self, spec: &WorkerSpec) -> Result<IsolationHandle> {
        let branch = spec.branch_name(&self.branch_prefix);
        if self
            .git
            .fork_branch(&branch, &self.dependency_branches(spec))
            .await?
        {
            debug!(worker = %spec.id, branch = %branch, "Worker branch created");
        }
        let worktree = self.git.add_worktree(
            &format!("foreman-{}", spec.id),
            &branch,
            &self.worktree_dir.join(&spec.id),
        )?;
        let brief = brief::write(&self.briefs_dir, spec, self.project.as_deref(), &branch)?;

        self.ensure_session().await?;
        let args = self.new_window_args(spec, &worktree, &brief);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let window_id = tmux(&args).await?.trim().to_string();
        if window_id.is_empty() {
            bail!("tmux did not report a window id for '{}'", spec.id);
        }

        let target = format!("{}:{}", self.session, window_id);
        let handle = IsolationHandle::new(target.clone());
        info!(worker = %spec.id, target = %target, branch = %branch, "Worker window opened");
        self.windows.lock().await.insert(
            handle.clone(),
            Window {
                worker: spec.id.clone(),
                target,
                worktree,
            },
        );
        Ok(handle)
    }

    async fn isolate(&self, handle: &IsolationHandle) -> Result<PathBuf> {
        self.window(handle)
            .await
            .map(|w| w.worktree)
            .with_context(|| format!("Unknown worker window '{}'", handle))
    }

    async fn send_input(&self, handle: &IsolationHandle, text: &str) -> Result<()> {
        let target = target_of(handle);
        tmux(&["send-keys", "-t", target, "-l", text]).await?;
        tmux(&["send-keys", "-t", target, "Enter"]).await?;
        debug!(target = %target, chars = text.len(), "Input sent");
        Ok(())
    }

    async fn stop(&self, handle: &IsolationHandle) -> Result<()> {
        let window = self.windows.lock().await.remove(handle);
        let target = window
            .as_ref()
            .map(|w| w.target.clone())
            .unwrap_or_else(|| target_of(handle).to_string());

        if let Some(window) = window {
            match self.git.commit_all(
                &window.worktree,
                &format!("foreman: checkpoint {}", window.worker),
            ) {
                Ok(Some(commit)) => info!(worker = %window.worker, commit = %commit, "Uncommitted work saved"),
                Ok(None) => {}
                Err(e) => warn!(worker = %window.worker, error = %e, "Failed to checkpoint worktree"),
            }
        }

        tmux(&["kill-window", "-t", &target]).await?;
        info!(target = %target, "Worker window closed");
        Ok(())
    }
}

#[async_trait]
impl OutputSource for TmuxProcess {
    async fn read_output(&self, handle: &IsolationHandle) -> Result<String> {
        tmux(&["capture-pane", "-p", "-J", "-t", target_of(handle)]).await
    }
}
