//! Typed error hierarchy for the foreman orchestrator.
//!
//! The enums follow the propagation policy of the orchestrator:
//! - `ConfigError` / `CycleError` (wrapped by `ResolveError`) are fatal at load
//!   and abort a phase before any worker launches
//! - `WorkerError` is scoped to a single worker and never affects siblings
//! - `MergeConflictError` halts integration of one wave only
//! - `OrchestratorError` is what the orchestrator core returns to callers

use crate::lifecycle::WorkerState;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors in the orchestration input (worker manifest or config file).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Worker entry {index} has an empty id")]
    EmptyId { index: usize },

    #[error("Duplicate worker id: {id}")]
    DuplicateWorker { id: String },

    #[error("Unknown dependency '{dependency}' in worker '{worker}': no worker with that id exists")]
    UnknownDependency { worker: String, dependency: String },

    #[error("Worker '{worker}' has an invalid token budget: low estimate {low} exceeds high estimate {high}")]
    InvalidBudget { worker: String, low: u64, high: u64 },

    #[error("Worker '{worker}' has an invalid owned path pattern '{pattern}': {source}")]
    InvalidOwnedPath {
        worker: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// A dependency cycle. `path` starts and ends with the same worker id.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Dependency cycle detected: {}", path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Errors from dependency resolution. Either variant means no schedule exists.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cycle(#[from] CycleError),
}

/// Worker-scoped errors.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Unknown worker '{worker}'")]
    UnknownWorker { worker: String },

    #[error("Worker '{worker}' cannot move from {from} to {to}")]
    InvalidTransition {
        worker: String,
        from: WorkerState,
        to: WorkerState,
    },

    #[error("Output of worker '{worker}' unreadable after {attempts} attempts: {message}")]
    PollFailure {
        worker: String,
        attempts: u32,
        message: String,
    },

    #[error("Worker '{worker}' shows a prompt that needs an operator: {signature}")]
    AmbiguousPrompt { worker: String, signature: String },

    #[error("Auto-approval for worker '{worker}' did not clear prompt {signature} after {attempts} re-polls")]
    VerificationFailure {
        worker: String,
        signature: String,
        attempts: u32,
    },

    #[error("Worker '{worker}' failed: {reason}")]
    Fatal { worker: String, reason: String },

    #[error("Worker '{worker}' has no running process (state {state})")]
    NotRunning { worker: String, state: WorkerState },
}

/// A merge that could not be completed without a manual resolution.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("Merge conflict integrating '{worker}' in wave {wave}: {} conflicting path(s)", paths.len())]
pub struct MergeConflictError {
    /// Wave index the worker belongs to
    pub wave: usize,
    /// Worker whose branch failed to merge
    pub worker: String,
    /// Paths git could not auto-resolve
    pub paths: Vec<PathBuf>,
    /// Workers whose owned paths cover any of the conflicting paths
    pub owners: Vec<String>,
}

/// Errors returned by the orchestrator core.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("A phase is already in progress")]
    PhaseInProgress,

    #[error("No phase is in progress")]
    NoActivePhase,

    #[error("Phase {phase} is sealed")]
    PhaseSealed { phase: u32 },

    #[error("Failed to persist phase archive: {0}")]
    Archive(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_the_path() {
        let err = CycleError {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn resolve_error_converts_from_config_error() {
        let err: ResolveError = ConfigError::DuplicateWorker { id: "api".into() }.into();
        match &err {
            ResolveError::Config(ConfigError::DuplicateWorker { id }) => assert_eq!(id, "api"),
            _ => panic!("Expected ResolveError::Config(DuplicateWorker)"),
        }
        assert!(err.to_string().contains("Duplicate worker id"));
    }

    #[test]
    fn invalid_transition_mentions_both_states() {
        let err = WorkerError::InvalidTransition {
            worker: "db".into(),
            from: WorkerState::Complete,
            to: WorkerState::Active,
        };
        let msg = err.to_string();
        assert!(msg.contains("complete"));
        assert!(msg.contains("active"));
    }

    #[test]
    fn merge_conflict_counts_paths() {
        let err = MergeConflictError {
            wave: 1,
            worker: "ui".into(),
            paths: vec![PathBuf::from("src/a.rs"), PathBuf::from("src/b.rs")],
            owners: vec!["ui".into()],
        };
        assert!(err.to_string().contains("2 conflicting path(s)"));
    }

    #[test]
    fn orchestrator_error_wraps_cycle() {
        let cycle = CycleError {
            path: vec!["x".into(), "x".into()],
        };
        let err: OrchestratorError = ResolveError::from(cycle).into();
        assert!(matches!(
            err,
            OrchestratorError::Resolve(ResolveError::Cycle(_))
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::EmptyId { index: 0 });
        assert_std_error(&WorkerError::UnknownWorker { worker: "x".into() });
        assert_std_error(&OrchestratorError::NoActivePhase);
    }
}
