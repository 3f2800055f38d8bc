//! In-memory collaborators for unit tests.

use crate::audit::{Escalation, PhaseArchive};
use crate::collaborators::{
    ArchiveStore, EscalationChannel, IsolationHandle, MergeOutcome, OutputSource, VersionControl,
    WorkerProcess,
};
use crate::config::ForemanConfig;
use crate::orchestrator::Collaborators;
use crate::worker::WorkerSpec;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

enum Step {
    Screen(String),
    Fail(String),
}

#[derive(Default)]
struct Pane {
    steps: VecDeque<Step>,
    current: String,
    after_input: Option<String>,
    sent: Vec<String>,
    stopped: bool,
    /// Appends a status line whose counter advances on every read
    ticking: bool,
    reads: u32,
}

/// Scripted worker processes. Each worker shows a queue of screens, then
/// keeps showing the last one.
#[derive(Default)]
pub struct FakeWorkers {
    panes: Mutex<HashMap<String, Pane>>,
    started: Mutex<Vec<String>>,
    fail_start: Mutex<HashSet<String>>,
    held_starts: Mutex<HashMap<String, Arc<Notify>>>,
}

impl FakeWorkers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_pane<T>(&self, id: &str, f: impl FnOnce(&mut Pane) -> T) -> T {
        let mut panes = self.panes.lock().unwrap();
        f(panes.entry(id.to_string()).or_default())
    }

    /// Queue screens for `id`.
    pub fn script(&self, id: &str, screens: &[&str]) {
        self.with_pane(id, |p| {
            p.steps
                .extend(screens.iter().map(|s| Step::Screen(s.to_string())));
        });
    }

    /// Queue `count` failing reads for `id`.
    pub fn fail_reads(&self, id: &str, count: usize) {
        self.with_pane(id, |p| {
            for _ in 0..count {
                p.steps.push_back(Step::Fail("pane unavailable".into()));
            }
        });
    }

    /// Add a changing status line below every screen of `id`.
    pub fn tick_status(&self, id: &str) {
        self.with_pane(id, |p| p.ticking = true);
    }

    /// Screen shown once any input has been sent.
    pub fn on_input(&self, id: &str, screen: &str) {
        self.with_pane(id, |p| p.after_input = Some(screen.to_string()));
    }

    /// Make `start` for `id` wait until the returned gate is notified.
    pub fn hold_start(&self, id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.held_starts
            .lock()
            .unwrap()
            .insert(id.to_string(), gate.clone());
        gate
    }

    pub fn fail_start(&self, id: &str) {
        self.fail_start.lock().unwrap().insert(id.to_string());
    }

    pub fn sent(&self, id: &str) -> Vec<String> {
        self.with_pane(id, |p| p.sent.clone())
    }

    pub fn stopped(&self, id: &str) -> bool {
        self.with_pane(id, |p| p.stopped)
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

fn worker_of(handle: &IsolationHandle) -> Result<&str> {
    handle
        .as_str()
        .strip_prefix("fake:")
        .ok_or_else(|| anyhow!("unknown handle {handle}"))
}

#[async_trait]
impl WorkerProcess for FakeWorkers {
    async fn start(&self, spec: &WorkerSpec) -> Result<IsolationHandle> {
        let gate = self.held_starts.lock().unwrap().get(&spec.id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_start.lock().unwrap().contains(&spec.id) {
            return Err(anyhow!("cannot start {}", spec.id));
        }
        self.started.lock().unwrap().push(spec.id.clone());
        Ok(IsolationHandle::new(format!("fake:{}", spec.id)))
    }

    async fn isolate(&self, handle: &IsolationHandle) -> Result<PathBuf> {
        Ok(PathBuf::from("/work").join(worker_of(handle)?))
    }

    async fn send_input(&self, handle: &IsolationHandle, text: &str) -> Result<()> {
        let id = worker_of(handle)?;
        self.with_pane(id, |p| {
            p.sent.push(text.to_string());
            if let Some(screen) = p.after_input.take() {
                p.steps.clear();
                p.current = screen;
            }
        });
        Ok(())
    }

    async fn stop(&self, handle: &IsolationHandle) -> Result<()> {
        let id = worker_of(handle)?;
        self.with_pane(id, |p| p.stopped = true);
        Ok(())
    }
}

#[async_trait]
impl OutputSource for FakeWorkers {
    async fn read_output(&self, handle: &IsolationHandle) -> Result<String> {
        let id = worker_of(handle)?;
        self.with_pane(id, |p| {
            let screen = match p.steps.pop_front() {
                Some(Step::Screen(screen)) => {
                    p.current = screen.clone();
                    screen
                }
                Some(Step::Fail(message)) => return Err(anyhow!(message)),
                None => p.current.clone(),
            };
            if !p.ticking {
                return Ok(screen);
            }
            p.reads += 1;
            Ok(format!("{}\n* Working ({}s)", screen, p.reads))
        })
    }
}

/// Branches as sets of changed paths; merges copy them into the target tree.
#[derive(Default)]
pub struct FakeVcs {
    changes: Mutex<HashMap<String, Vec<PathBuf>>>,
    conflicts: Mutex<HashMap<String, Vec<PathBuf>>>,
    tree: Mutex<HashSet<PathBuf>>,
    merged: Mutex<Vec<String>>,
    tags: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_changes(&self, branch: &str, paths: &[&str]) {
        self.changes
            .lock()
            .unwrap()
            .insert(branch.to_string(), paths.iter().map(PathBuf::from).collect());
    }

    pub fn set_conflict(&self, branch: &str, paths: &[&str]) {
        self.conflicts
            .lock()
            .unwrap()
            .insert(branch.to_string(), paths.iter().map(PathBuf::from).collect());
    }

    pub fn merged(&self) -> Vec<String> {
        self.merged.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.lock().unwrap().clone()
    }
}

#[async_trait]
impl VersionControl for FakeVcs {
    async fn merge(&self, source: &str, _target: &str) -> Result<MergeOutcome> {
        if let Some(paths) = self.conflicts.lock().unwrap().get(source) {
            return Ok(MergeOutcome::conflicted(paths.clone()));
        }
        let changed = self
            .changes
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_default();
        self.tree.lock().unwrap().extend(changed);
        self.merged.lock().unwrap().push(source.to_string());
        Ok(MergeOutcome::clean())
    }

    async fn tag(&self, name: &str) -> Result<()> {
        self.tags.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn changed_paths(&self, source: &str, _target: &str) -> Result<Vec<PathBuf>> {
        Ok(self
            .changes
            .lock()
            .unwrap()
            .get(source)
            .cloned()
            .unwrap_or_default())
    }

    async fn path_exists(&self, _target: &str, path: &Path) -> Result<bool> {
        Ok(self.tree.lock().unwrap().contains(path))
    }
}

#[derive(Default)]
pub struct MemoryArchive {
    saved: Mutex<Vec<PhaseArchive>>,
}

impl MemoryArchive {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saved(&self) -> Vec<PhaseArchive> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn save(&self, archive: &PhaseArchive) -> Result<String> {
        self.saved.lock().unwrap().push(archive.clone());
        Ok(format!("memory:{}", archive.phase))
    }

    async fn latest_phase(&self) -> Result<Option<u32>> {
        Ok(self.saved.lock().unwrap().iter().map(|a| a.phase).max())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    received: Mutex<Vec<Escalation>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Escalation> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EscalationChannel for RecordingChannel {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        self.received.lock().unwrap().push(escalation.clone());
        Ok(())
    }
}

/// Every fake, plus the `Collaborators` bundle wired to them.
pub struct Fakes {
    pub workers: Arc<FakeWorkers>,
    pub vcs: Arc<FakeVcs>,
    pub archive: Arc<MemoryArchive>,
    pub channel: Arc<RecordingChannel>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            workers: FakeWorkers::new(),
            vcs: FakeVcs::new(),
            archive: MemoryArchive::new(),
            channel: RecordingChannel::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            process: self.workers.clone(),
            output: self.workers.clone(),
            vcs: self.vcs.clone(),
            archive: self.archive.clone(),
            escalation: self.channel.clone(),
        }
    }
}

/// Defaults with millisecond timers and no files written.
pub fn fast_config() -> ForemanConfig {
    let mut config = ForemanConfig::with_defaults(PathBuf::from("/work"));
    config.toml.poller.interval_ms = 5;
    config.toml.poller.read_retries = 2;
    config.toml.poller.read_timeout_ms = 200;
    config.toml.approval.verify_delay_ms = 5;
    config.toml.approval.verify_retries = 2;
    config.toml.approval.verify_timeout_ms = 200;
    config.toml.approval.decisions_jsonl = false;
    config
}
