//! Audit records: approval decisions, escalations, operator actions, and
//! the sealed phase archive.

use crate::dag::ExecutionWave;
use crate::integration::IntegrationReport;
use crate::lifecycle::{BlockedReason, TransitionRecord, WorkerRuntime, WorkerState};
use crate::worker::{TokenBudget, WorkerSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// What the decision engine did with a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    AutoApprove,
    Escalate,
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalAction::AutoApprove => write!(f, "auto_approve"),
            ApprovalAction::Escalate => write!(f, "escalate"),
        }
    }
}

/// One classification by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub worker_id: String,
    pub raw_snapshot_excerpt: String,
    pub classified_signature: String,
    pub action_taken: ApprovalAction,
    /// For auto-approvals: the prompt was seen to clear
    pub verified: bool,
    /// Name of the rule that fired
    pub rule: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    PromptEscalated,
    VerificationFailed,
    PollFailure,
    StartTimeout,
    WorkerFailed,
    MergeConflict,
    PathOverlap,
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PromptEscalated => "prompt_escalated",
            Self::VerificationFailed => "verification_failed",
            Self::PollFailure => "poll_failure",
            Self::StartTimeout => "start_timeout",
            Self::WorkerFailed => "worker_failed",
            Self::MergeConflict => "merge_conflict",
            Self::PathOverlap => "path_overlap",
        };
        f.write_str(s)
    }
}

/// Something an operator needs to look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    /// None for phase-level escalations
    pub worker_id: Option<String>,
    pub kind: EscalationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Escalation {
    pub fn worker(id: &str, kind: EscalationKind, message: impl Into<String>) -> Self {
        Self {
            worker_id: Some(id.to_string()),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn phase(kind: EscalationKind, message: impl Into<String>) -> Self {
        Self {
            worker_id: None,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorActionKind {
    Respond,
    Cancel,
}

/// An operator intervention during a running phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorAction {
    pub worker_id: String,
    pub action: OperatorActionKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl OperatorAction {
    pub fn new(worker_id: &str, action: OperatorActionKind, detail: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            action,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Token estimate against actual consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub estimate: TokenBudget,
    pub actual: u64,
}

impl TokenUsage {
    pub fn over_budget(&self) -> bool {
        self.estimate.is_exceeded_by(self.actual)
    }
}

/// Final record of one worker in a sealed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub spec: WorkerSpec,
    pub final_state: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockedReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl From<WorkerRuntime> for WorkerRecord {
    fn from(rt: WorkerRuntime) -> Self {
        Self {
            tokens: TokenUsage {
                estimate: rt.spec.token_budget,
                actual: rt.tokens_consumed,
            },
            final_state: rt.state,
            blocked_reason: rt.blocked_reason,
            failure: rt.failure,
            workspace: rt.workspace,
            started_at: rt.started_at,
            finished_at: rt.finished_at,
            transitions: rt.transitions,
            spec: rt.spec,
        }
    }
}

/// How a phase was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    /// Archived; configuration and collaborators kept for the next phase
    PhaseClose,
    /// Archived and all orchestration state torn down
    Closeout,
}

/// The sealed, read-only record of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseArchive {
    pub archive_id: Uuid,
    pub phase: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub started_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
    pub close_mode: CloseMode,
    pub waves: Vec<ExecutionWave>,
    pub workers: Vec<WorkerRecord>,
    pub approvals: Vec<ApprovalEvent>,
    pub escalations: Vec<Escalation>,
    pub operator_actions: Vec<OperatorAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<IntegrationReport>,
}

impl PhaseArchive {
    /// Every worker COMPLETE and the integration report fully clean.
    pub fn is_fully_successful(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.final_state == WorkerState::Complete)
            && self
                .integration
                .as_ref()
                .is_some_and(|r| r.is_fully_successful())
    }

    pub fn count_in(&self, state: WorkerState) -> usize {
        self.workers.iter().filter(|w| w.final_state == state).count()
    }

    /// Specs for an operator-initiated re-run: every worker that did not
    /// reach COMPLETE, with dependencies on completed workers dropped.
    pub fn outstanding_specs(&self) -> Vec<WorkerSpec> {
        let outstanding: HashSet<&str> = self
            .workers
            .iter()
            .filter(|w| w.final_state != WorkerState::Complete)
            .map(|w| w.spec.id.as_str())
            .collect();

        self.workers
            .iter()
            .filter(|w| outstanding.contains(w.spec.id.as_str()))
            .map(|w| {
                let mut spec = w.spec.clone();
                spec.dependencies
                    .retain(|dep| outstanding.contains(dep.as_str()));
                spec
            })
            .collect()
    }
}

pub mod archive;
pub mod log;

pub use archive::FsArchiveStore;
pub use log::AuditLog;
