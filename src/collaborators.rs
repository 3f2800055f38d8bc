//! Boundary traits for everything the orchestrator does not own.
//!
//! The core only talks to these traits. Concrete implementations live in
//! `crate::adapters`; tests use in-memory doubles.

use crate::audit::{Escalation, PhaseArchive};
use crate::worker::WorkerSpec;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Opaque reference to a running worker process, issued by `WorkerProcess::start`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IsolationHandle(String);

impl IsolationHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IsolationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Starts, isolates, drives and stops worker processes.
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    /// Launch the process for `spec`.
    async fn start(&self, spec: &WorkerSpec) -> Result<IsolationHandle>;

    /// Give the worker its own branch and working directory.
    async fn isolate(&self, handle: &IsolationHandle) -> Result<PathBuf>;

    /// Type `text` into the worker followed by Enter.
    async fn send_input(&self, handle: &IsolationHandle, text: &str) -> Result<()>;

    /// Terminate the process. The isolated branch is left in place.
    async fn stop(&self, handle: &IsolationHandle) -> Result<()>;
}

/// Reads the current visible output of a worker.
#[async_trait]
pub trait OutputSource: Send + Sync {
    async fn read_output(&self, handle: &IsolationHandle) -> Result<String>;
}

/// Result of merging one branch into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    /// Paths that could not be merged automatically
    #[serde(default)]
    pub conflicts: Vec<PathBuf>,
}

impl MergeOutcome {
    pub fn clean() -> Self {
        Self {
            success: true,
            conflicts: Vec::new(),
        }
    }

    pub fn conflicted(paths: Vec<PathBuf>) -> Self {
        Self {
            success: false,
            conflicts: paths,
        }
    }
}

/// Branch-level version control operations used during integration.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Merge `source` into `target`. A conflicted merge leaves `target` untouched.
    async fn merge(&self, source: &str, target: &str) -> Result<MergeOutcome>;

    /// Tag the current tip of the integration target.
    async fn tag(&self, name: &str) -> Result<()>;

    /// Paths changed on `source` since it diverged from `target`.
    async fn changed_paths(&self, source: &str, target: &str) -> Result<Vec<PathBuf>>;

    /// Whether `path` exists in the tree at the tip of `target`.
    async fn path_exists(&self, target: &str, path: &Path) -> Result<bool>;
}

/// Where sealed phases are persisted.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Persist `archive`, returning a pointer (path or key) to it.
    async fn save(&self, archive: &PhaseArchive) -> Result<String>;

    /// Number of the most recently sealed phase, if any.
    async fn latest_phase(&self) -> Result<Option<u32>>;
}

/// Routes escalations to a human operator.
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    async fn notify(&self, escalation: &Escalation) -> Result<()>;
}
