//! Worker declarations and manifest loading.
//!
//! This module provides:
//! - `WorkerSpec`, the immutable declaration of one worker
//! - `TokenBudget`, the low/high token estimate for a worker
//! - `WorkersManifest`, the orchestration input file (JSON or YAML)

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Low/high estimate of the tokens a worker is expected to consume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub low: u64,
    pub high: u64,
}

impl TokenBudget {
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// A budget of zero means no estimate was declared.
    pub fn is_declared(&self) -> bool {
        self.high > 0
    }

    pub fn is_exceeded_by(&self, consumed: u64) -> bool {
        self.is_declared() && consumed > self.high
    }
}

/// Declaration of a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Unique worker id (e.g. "backend", "api-tests")
    pub id: String,
    /// Role description handed to the worker
    pub role: String,
    /// Ids of workers that must complete before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Advisory partition of the source tree (glob patterns or directory prefixes)
    #[serde(default)]
    pub owned_paths: Vec<String>,
    #[serde(default)]
    pub token_budget: TokenBudget,
    /// Paths the worker is expected to produce, relative to the repository root
    #[serde(default)]
    pub deliverables: Vec<PathBuf>,
    /// Free-form task description included in the worker brief
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Assistant command override for this worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Isolation branch name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl WorkerSpec {
    pub fn new(id: &str, role: &str, dependencies: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            role: role.to_string(),
            dependencies,
            owned_paths: Vec::new(),
            token_budget: TokenBudget::default(),
            deliverables: Vec::new(),
            description: None,
            agent: None,
            branch: None,
        }
    }

    pub fn with_owned_paths(mut self, paths: &[&str]) -> Self {
        self.owned_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_deliverables(mut self, paths: &[&str]) -> Self {
        self.deliverables = paths.iter().map(PathBuf::from).collect();
        self
    }

    pub fn with_token_budget(mut self, low: u64, high: u64) -> Self {
        self.token_budget = TokenBudget::new(low, high);
        self
    }

    /// Whether `path` (relative to the repository root) falls inside this
    /// worker's owned paths.
    pub fn owns(&self, path: &Path) -> bool {
        self.owned_paths
            .iter()
            .any(|pattern| path_matches(pattern, path))
    }

    /// Branch used to isolate this worker's changes.
    pub fn branch_name(&self, prefix: &str) -> String {
        self.branch
            .clone()
            .unwrap_or_else(|| format!("{}/{}", prefix, self.id))
    }
}

/// Match an owned-path entry against a relative path.
///
/// Entries containing glob metacharacters are matched as globs; anything
/// else is a directory or file prefix, compared component-wise.
pub fn path_matches(pattern: &str, path: &Path) -> bool {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return false;
    }
    if pattern.contains(['*', '?', '[']) {
        return glob::Pattern::new(pattern)
            .map(|p| p.matches_path(path))
            .unwrap_or(false);
    }
    let prefix = Path::new(pattern.trim_end_matches('/'));
    path.starts_with(prefix)
}

/// Project metadata carried by a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub name: Option<String>,
    /// Short name used for tmux sessions and branch prefixes
    #[serde(default)]
    pub slug: Option<String>,
}

/// The orchestration input: every worker of one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersManifest {
    #[serde(default)]
    pub project: ProjectInfo,
    pub workers: Vec<WorkerSpec>,
}

impl WorkersManifest {
    /// Load a manifest from a `.json`, `.yaml` or `.yml` file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("yaml") || e.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::from_yaml(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        } else {
            Self::from_json(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    }

    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }

    pub fn from_yaml(content: &str) -> serde_yaml::Result<Self> {
        serde_yaml::from_str(content)
    }

    /// Slug used to name the tmux session and isolation branches.
    pub fn slug(&self) -> String {
        self.project
            .slug
            .clone()
            .or_else(|| self.project.name.as_ref().map(|n| slugify(n)))
            .unwrap_or_else(|| "foreman".to_string())
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "foreman".to_string()
    } else {
        slug
    }
}
