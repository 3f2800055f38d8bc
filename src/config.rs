//! Layered configuration for foreman.
//!
//! Settings are read from `.foreman/foreman.toml`, then overridden by
//! environment variables, then by CLI flags. Every field is optional.
//!
//! # Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! max_concurrent = 4
//! target_branch = "main"
//! branch_prefix = "foreman"
//! tag_prefix = "foreman"
//!
//! [poller]
//! interval_ms = 2000
//! read_retries = 3
//! start_timeout_secs = 120
//! escalation_wait_secs = 1800
//!
//! [approval]
//! auto_approve = true
//! context_lines = 12
//! verify_delay_ms = 1500
//! verify_retries = 3
//! verify_timeout_ms = 5000
//! protected_branches = ["main", "master", "production"]
//!
//! [integration]
//! overlap_policy = "warn"
//! tag_clean_runs = true
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! file = false
//!
//! [tmux]
//! agent_command = "claude"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What to do when two workers in one wave change the same path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Report the overlap and merge anyway
    #[default]
    Warn,
    /// Do not merge the overlapping workers
    Fail,
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapPolicy::Warn => write!(f, "warn"),
            OverlapPolicy::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "warn" => Ok(OverlapPolicy::Warn),
            "fail" => Ok(OverlapPolicy::Fail),
            _ => anyhow::bail!("Invalid overlap policy '{}'. Valid values: warn, fail", s),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Wave scheduling and branch naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Workers allowed in STARTING, ACTIVE or BLOCKED at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Branch every worker is merged into
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    /// Prefix for per-worker isolation branches
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    /// Prefix for tags on clean integrations
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

fn default_max_concurrent() -> usize {
    4
}

fn default_target_branch() -> String {
    "main".to_string()
}

fn default_branch_prefix() -> String {
    "foreman".to_string()
}

fn default_tag_prefix() -> String {
    "foreman".to_string()
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            target_branch: default_target_branch(),
            branch_prefix: default_branch_prefix(),
            tag_prefix: default_tag_prefix(),
        }
    }
}

/// Output polling and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive failed reads before the worker is blocked
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// How long an escalated worker may wait for an operator before failing
    #[serde(default = "default_escalation_wait_secs")]
    pub escalation_wait_secs: u64,
    /// Upper bound on a single output read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_read_retries() -> u32 {
    3
}

fn default_start_timeout_secs() -> u64 {
    120
}

fn default_escalation_wait_secs() -> u64 {
    1800
}

fn default_read_timeout_ms() -> u64 {
    5000
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            read_retries: default_read_retries(),
            start_timeout_secs: default_start_timeout_secs(),
            escalation_wait_secs: default_escalation_wait_secs(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl PollerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn escalation_wait(&self) -> Duration {
        Duration::from_secs(self.escalation_wait_secs)
    }
}

/// Approval decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSection {
    /// When false, every prompt escalates
    #[serde(default = "default_auto_approve")]
    pub auto_approve: bool,
    /// Lines before the prompt used for classification
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Push targets that always escalate
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    /// Mirror approval events to `.foreman/logs/decisions.jsonl`
    #[serde(default = "default_decisions_jsonl")]
    pub decisions_jsonl: bool,
}

fn default_auto_approve() -> bool {
    true
}

fn default_context_lines() -> usize {
    12
}

fn default_verify_delay_ms() -> u64 {
    1500
}

fn default_verify_retries() -> u32 {
    3
}

fn default_verify_timeout_ms() -> u64 {
    5000
}

fn default_protected_branches() -> Vec<String> {
    vec![
        "main".to_string(),
        "master".to_string(),
        "production".to_string(),
    ]
}

fn default_decisions_jsonl() -> bool {
    true
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            auto_approve: default_auto_approve(),
            context_lines: default_context_lines(),
            verify_delay_ms: default_verify_delay_ms(),
            verify_retries: default_verify_retries(),
            verify_timeout_ms: default_verify_timeout_ms(),
            protected_branches: default_protected_branches(),
            decisions_jsonl: default_decisions_jsonl(),
        }
    }
}

impl ApprovalSection {
    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

/// Branch integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationSection {
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    /// Tag the target branch after a fully clean integration
    #[serde(default = "default_tag_clean_runs")]
    pub tag_clean_runs: bool,
}

fn default_tag_clean_runs() -> bool {
    true
}

impl Default for IntegrationSection {
    fn default() -> Self {
        Self {
            overlap_policy: OverlapPolicy::default(),
            tag_clean_runs: default_tag_clean_runs(),
        }
    }
}

/// Tracing subscriber setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily-rotated JSON logs under `.foreman/logs`
    #[serde(default)]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: false,
        }
    }
}

/// Phase archive location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveSection {
    /// Defaults to `.foreman/archive`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// tmux worker adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmuxSection {
    /// Session name; defaults to the manifest's project slug
    #[serde(default)]
    pub session: Option<String>,
    /// Assistant command started in each worker window
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default)]
    pub agent_args: Vec<String>,
    /// Defaults to `.foreman/worktrees`
    #[serde(default)]
    pub worktree_dir: Option<PathBuf>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

impl Default for TmuxSection {
    fn default() -> Self {
        Self {
            session: None,
            agent_command: default_agent_command(),
            agent_args: Vec::new(),
            worktree_dir: None,
        }
    }
}

/// The complete foreman.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default)]
    pub integration: IntegrationSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub archive: ArchiveSection,
    #[serde(default)]
    pub tmux: TmuxSection,
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults if it does not exist.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join("foreman.toml");
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `FOREMAN_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FOREMAN_MAX_CONCURRENT") {
            self.orchestrator.max_concurrent = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid FOREMAN_MAX_CONCURRENT '{}'", value))?;
        }
        if let Some(value) = lookup("FOREMAN_TARGET_BRANCH")
            && !value.trim().is_empty()
        {
            self.orchestrator.target_branch = value.trim().to_string();
        }
        if let Some(value) = lookup("FOREMAN_AUTO_APPROVE") {
            self.approval.auto_approve = parse_bool(&value)
                .with_context(|| format!("Invalid FOREMAN_AUTO_APPROVE '{}'", value))?;
        }
        if let Some(value) = lookup("FOREMAN_LOG")
            && !value.trim().is_empty()
        {
            self.logging.level = value.trim().to_string();
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.orchestrator.max_concurrent == 0 {
            warnings.push(
                "orchestrator.max_concurrent is 0: no worker will ever be launched".to_string(),
            );
        }
        if self.orchestrator.target_branch.trim().is_empty() {
            warnings.push("orchestrator.target_branch is empty".to_string());
        }
        if self.poller.interval_ms == 0 {
            warnings.push("poller.interval_ms is 0: pollers will spin".to_string());
        }
        if self.poller.read_retries == 0 {
            warnings.push(
                "poller.read_retries is 0: a single failed read blocks the worker".to_string(),
            );
        }
        if self.poller.start_timeout_secs == 0 {
            warnings.push(
                "poller.start_timeout_secs is 0: every worker will time out on start".to_string(),
            );
        }
        if self.poller.escalation_wait_secs == 0 {
            warnings.push(
                "poller.escalation_wait_secs is 0: escalated workers fail immediately".to_string(),
            );
        }
        if self.approval.verify_retries == 0 {
            warnings.push(
                "approval.verify_retries is 0: every auto-approval will escalate".to_string(),
            );
        }
        if self.approval.verify_timeout_ms == 0 {
            warnings.push("approval.verify_timeout_ms is 0: verification reads always time out".to_string());
        }
        if self.approval.context_lines == 0 {
            warnings.push(
                "approval.context_lines is 0: prompts are classified from the prompt line only"
                    .to_string(),
            );
        }
        if self.approval.protected_branches.is_empty() {
            warnings.push("approval.protected_branches is empty".to_string());
        }

        warnings
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected true/false, got '{}'", other),
    }
}

/// Effective configuration: file, then environment, then CLI.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    pub project_dir: PathBuf,
    pub foreman_dir: PathBuf,
    pub toml: ForemanToml,
    pub verbose: bool,
}

impl ForemanConfig {
    /// Load configuration for `project_dir`, including environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let foreman_dir = project_dir.join(".foreman");
        let mut toml = ForemanToml::load_or_default(&foreman_dir)?;
        toml.apply_env(|key| std::env::var(key).ok())?;

        Ok(Self {
            project_dir,
            foreman_dir,
            toml,
            verbose: false,
        })
    }

    /// Configuration with defaults only, rooted at `project_dir`. No file or
    /// environment is read.
    pub fn with_defaults(project_dir: PathBuf) -> Self {
        let foreman_dir = project_dir.join(".foreman");
        Self {
            project_dir,
            foreman_dir,
            toml: ForemanToml::default(),
            verbose: false,
        }
    }

    /// Apply CLI flags on top of file and environment.
    pub fn with_cli_overrides(
        mut self,
        max_concurrent: Option<usize>,
        target_branch: Option<String>,
        no_auto_approve: bool,
        verbose: bool,
    ) -> Self {
        if let Some(max) = max_concurrent {
            self.toml.orchestrator.max_concurrent = max;
        }
        if let Some(branch) = target_branch {
            self.toml.orchestrator.target_branch = branch;
        }
        if no_auto_approve {
            self.toml.approval.auto_approve = false;
        }
        self.verbose = verbose;
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.foreman_dir.join("foreman.toml")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.toml
            .archive
            .dir
            .clone()
            .map(|d| self.resolve(d))
            .unwrap_or_else(|| self.foreman_dir.join("archive"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.foreman_dir.join("logs")
    }

    pub fn decisions_log(&self) -> Option<PathBuf> {
        self.toml
            .approval
            .decisions_jsonl
            .then(|| self.log_dir().join("decisions.jsonl"))
    }

    pub fn escalations_log(&self) -> PathBuf {
        self.log_dir().join("escalations.jsonl")
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.toml
            .tmux
            .worktree_dir
            .clone()
            .map(|d| self.resolve(d))
            .unwrap_or_else(|| self.foreman_dir.join("worktrees"))
    }

    pub fn briefs_dir(&self) -> PathBuf {
        self.foreman_dir.join("briefs")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [self.foreman_dir.clone(), self.log_dir(), self.archive_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }

    fn resolve(&self, path: PathBuf) -> PathBuf {
        if path.is_absolute() {
            path
        } else {
            self.project_dir.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overlap_policy_parse_and_display() {
        assert_eq!("WARN".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Warn);
        assert_eq!("fail".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Fail);
        assert_eq!(OverlapPolicy::Fail.to_string(), "fail");
        let err = "maybe".parse::<OverlapPolicy>().unwrap_err();
        assert!(err.to_string().contains("Invalid overlap policy"));
    }

    #[test]
    fn test_defaults() {
        let config = ForemanToml::default();
        assert_eq!(config.orchestrator.max_concurrent, 4);
        assert_eq!(config.orchestrator.target_branch, "main");
        assert!(config.approval.auto_approve);
        assert_eq!(config.integration.overlap_policy, OverlapPolicy::Warn);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ForemanToml::parse(
            r#"
            [orchestrator]
            max_concurrent = 2

            [integration]
            overlap_policy = "fail"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.orchestrator.max_concurrent, 2);
        assert_eq!(config.orchestrator.branch_prefix, "foreman");
        assert_eq!(config.integration.overlap_policy, OverlapPolicy::Fail);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.poller.read_retries, 3);
    }

    #[test]
    fn test_parse_rejects_bad_enum() {
        let err = ForemanToml::parse("[integration]\noverlap_policy = \"sometimes\"\n").unwrap_err();
        assert!(err.to_string().contains("foreman.toml"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ForemanToml::default();
        config
            .apply_env(env(&[
                ("FOREMAN_MAX_CONCURRENT", "8"),
                ("FOREMAN_TARGET_BRANCH", "develop"),
                ("FOREMAN_AUTO_APPROVE", "off"),
                ("FOREMAN_LOG", "debug"),
            ]))
            .unwrap();

        assert_eq!(config.orchestrator.max_concurrent, 8);
        assert_eq!(config.orchestrator.target_branch, "develop");
        assert!(!config.approval.auto_approve);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_env_override_invalid_number() {
        let mut config = ForemanToml::default();
        let err = config
            .apply_env(env(&[("FOREMAN_MAX_CONCURRENT", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("FOREMAN_MAX_CONCURRENT"));
    }

    #[test]
    fn test_validate_warns_on_zero_values() {
        let mut config = ForemanToml::default();
        config.orchestrator.max_concurrent = 0;
        config.poller.start_timeout_secs = 0;
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("max_concurrent"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let foreman_dir = dir.path().join(".foreman");
        std::fs::create_dir_all(&foreman_dir).unwrap();

        let mut config = ForemanToml::default();
        config.approval.protected_branches = vec!["release".into()];
        config.save(&foreman_dir.join("foreman.toml")).unwrap();

        let loaded = ForemanToml::load_or_default(&foreman_dir).unwrap();
        assert_eq!(loaded.approval.protected_branches, vec!["release"]);
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = tempdir().unwrap();
        let config = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.poller.interval_ms, 2000);
    }

    #[test]
    fn test_cli_overrides_win() {
        let dir = tempdir().unwrap();
        let config = ForemanConfig::with_defaults(dir.path().to_path_buf()).with_cli_overrides(
            Some(1),
            Some("integration".into()),
            true,
            true,
        );

        assert_eq!(config.toml.orchestrator.max_concurrent, 1);
        assert_eq!(config.toml.orchestrator.target_branch, "integration");
        assert!(!config.toml.approval.auto_approve);
        assert!(config.verbose);
    }

    #[test]
    fn test_paths_resolve_under_foreman_dir() {
        let dir = tempdir().unwrap();
        let mut config = ForemanConfig::with_defaults(dir.path().to_path_buf());
        assert_eq!(config.archive_dir(), dir.path().join(".foreman/archive"));
        assert_eq!(
            config.decisions_log(),
            Some(dir.path().join(".foreman/logs/decisions.jsonl"))
        );

        config.toml.archive.dir = Some(PathBuf::from("records"));
        assert_eq!(config.archive_dir(), dir.path().join("records"));

        config.toml.approval.decisions_jsonl = false;
        assert!(config.decisions_log().is_none());
    }
}
