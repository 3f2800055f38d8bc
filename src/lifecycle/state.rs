//! Worker state machine and per-worker runtime record.

use crate::collaborators::IsolationHandle;
use crate::errors::WorkerError;
use crate::worker::WorkerSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::time::Instant;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting on dependencies
    #[default]
    Pending,
    /// Dependencies complete, waiting for a launch slot
    Ready,
    /// Launched, no output observed yet
    Starting,
    /// Producing output
    Active,
    /// Waiting on an operator
    Blocked,
    /// Emitted its completion marker
    Complete,
    /// Terminal failure
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// States that hold a launch slot.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Blocked)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition_to(&self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Pending, Ready)
                | (Ready, Starting)
                | (Starting, Active)
                | (Starting, Blocked)
                | (Active, Blocked)
                | (Blocked, Active)
                | (Active, Complete)
                | (Pending | Ready | Starting | Active | Blocked, Failed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a worker is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockedReason {
    /// A dependency (direct or transitive) failed; never recovers automatically
    UpstreamFailed { dependency: String },
    /// Output could not be read after the retry ceiling
    PollFailure { attempts: u32 },
    /// A prompt was escalated to the operator
    Escalated { signature: String },
    /// An auto-approval did not clear its prompt
    VerificationFailed { signature: String },
    /// No output within the start timeout
    StartTimeout,
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpstreamFailed { dependency } => write!(f, "upstream failed: {dependency}"),
            Self::PollFailure { attempts } => write!(f, "output unreadable after {attempts} attempts"),
            Self::Escalated { signature } => write!(f, "escalated prompt {signature}"),
            Self::VerificationFailed { signature } => {
                write!(f, "auto-approval not verified for {signature}")
            }
            Self::StartTimeout => f.write_str("no output before start timeout"),
        }
    }
}

/// One entry of a worker's transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkerState,
    pub to: WorkerState,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Mutable runtime record of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRuntime {
    pub spec: WorkerSpec,
    pub state: WorkerState,
    pub isolation_handle: Option<IsolationHandle>,
    pub workspace: Option<PathBuf>,
    pub tokens_consumed: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<BlockedReason>,
    pub failure: Option<String>,
    pub last_operator_action: Option<DateTime<Utc>>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    /// Start of the current start-timeout or escalation wait
    #[serde(skip)]
    pub waiting_since: Option<Instant>,
    #[serde(skip)]
    pub budget_warned: bool,
}

impl WorkerRuntime {
    pub fn new(spec: WorkerSpec) -> Self {
        Self {
            spec,
            state: WorkerState::Pending,
            isolation_handle: None,
            workspace: None,
            tokens_consumed: 0,
            started_at: None,
            finished_at: None,
            blocked_reason: None,
            failure: None,
            last_operator_action: None,
            transitions: Vec::new(),
            waiting_since: None,
            budget_warned: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    /// Terminal, or held in PENDING by an upstream failure.
    pub fn is_settled(&self) -> bool {
        self.state.is_terminal()
            || (self.state == WorkerState::Pending
                && matches!(self.blocked_reason, Some(BlockedReason::UpstreamFailed { .. })))
    }

    /// Apply a transition, updating timestamps. Rejected moves leave the record unchanged.
    pub fn transition(&mut self, to: WorkerState, note: Option<String>) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(to) {
            return Err(WorkerError::InvalidTransition {
                worker: self.spec.id.clone(),
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        match to {
            WorkerState::Starting => {
                self.started_at = Some(now);
                self.waiting_since = Some(Instant::now());
            }
            WorkerState::Blocked => {
                self.waiting_since = Some(Instant::now());
            }
            WorkerState::Active => {
                self.blocked_reason = None;
                self.waiting_since = None;
            }
            WorkerState::Complete | WorkerState::Failed => {
                self.finished_at = Some(now);
                self.waiting_since = None;
            }
            WorkerState::Pending | WorkerState::Ready => {}
        }

        self.transitions.push(TransitionRecord {
            from: self.state,
            to,
            at: now,
            note,
        });
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> WorkerRuntime {
        WorkerRuntime::new(WorkerSpec::new("api", "backend", vec![]))
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(WorkerState::Blocked.to_string(), "blocked");
        assert_eq!(
            serde_json::to_string(&WorkerState::Complete).unwrap(),
            "\"complete\""
        );
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut rt = runtime();
        for to in [
            WorkerState::Ready,
            WorkerState::Starting,
            WorkerState::Active,
            WorkerState::Blocked,
            WorkerState::Active,
            WorkerState::Complete,
        ] {
            rt.transition(to, None).unwrap();
        }
        assert_eq!(rt.state, WorkerState::Complete);
        assert_eq!(rt.transitions.len(), 6);
        assert!(rt.started_at.is_some());
        assert!(rt.finished_at.is_some());
    }

    #[test]
    fn test_invalid_transition_leaves_record_unchanged() {
        let mut rt = runtime();
        let err = rt.transition(WorkerState::Active, None).unwrap_err();
        assert!(matches!(
            err,
            WorkerError::InvalidTransition {
                from: WorkerState::Pending,
                to: WorkerState::Active,
                ..
            }
        ));
        assert_eq!(rt.state, WorkerState::Pending);
        assert!(rt.transitions.is_empty());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [WorkerState::Complete, WorkerState::Failed] {
            for to in [
                WorkerState::Pending,
                WorkerState::Ready,
                WorkerState::Active,
                WorkerState::Failed,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_blocked_cannot_complete_directly() {
        assert!(!WorkerState::Blocked.can_transition_to(WorkerState::Complete));
        assert!(WorkerState::Blocked.can_transition_to(WorkerState::Failed));
    }

    #[test]
    fn test_activation_clears_blocked_reason() {
        let mut rt = runtime();
        rt.transition(WorkerState::Ready, None).unwrap();
        rt.transition(WorkerState::Starting, None).unwrap();
        rt.transition(WorkerState::Blocked, None).unwrap();
        rt.blocked_reason = Some(BlockedReason::StartTimeout);
        assert!(rt.waiting_since.is_some());

        rt.transition(WorkerState::Active, None).unwrap();
        assert!(rt.blocked_reason.is_none());
        assert!(rt.waiting_since.is_none());
    }

    #[test]
    fn test_settled() {
        let mut rt = runtime();
        assert!(!rt.is_settled());
        rt.blocked_reason = Some(BlockedReason::UpstreamFailed {
            dependency: "db".into(),
        });
        assert!(rt.is_settled());

        let mut failed = runtime();
        failed.transition(WorkerState::Failed, None).unwrap();
        assert!(failed.is_settled());
    }
}
