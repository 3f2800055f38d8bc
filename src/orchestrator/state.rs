//! The explicit state object shared by the core, the pollers and the
//! integration coordinator for one phase.

use crate::approval::ApprovalEngine;
use crate::audit::{AuditLog, Escalation, EscalationKind};
use crate::collaborators::{
    ArchiveStore, EscalationChannel, OutputSource, VersionControl, WorkerProcess,
};
use crate::config::ForemanConfig;
use crate::dag::DependencyGraph;
use crate::lifecycle::LifecycleManager;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Concrete implementations of every collaborator boundary.
#[derive(Clone)]
pub struct Collaborators {
    pub process: Arc<dyn WorkerProcess>,
    pub output: Arc<dyn OutputSource>,
    pub vcs: Arc<dyn VersionControl>,
    pub archive: Arc<dyn ArchiveStore>,
    pub escalation: Arc<dyn EscalationChannel>,
}

pub struct OrchestratorState {
    pub config: Arc<ForemanConfig>,
    pub collaborators: Collaborators,
    pub lifecycle: LifecycleManager,
    pub audit: AuditLog,
    pub engine: ApprovalEngine,
    pub phase: u32,
    pub started_at: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(
        config: Arc<ForemanConfig>,
        collaborators: Collaborators,
        graph: DependencyGraph,
        phase: u32,
    ) -> Self {
        let audit = AuditLog::new(config.decisions_log());
        let engine = ApprovalEngine::new(config.toml.approval.clone());
        Self {
            lifecycle: LifecycleManager::new(graph),
            audit,
            engine,
            phase,
            started_at: Utc::now(),
            config,
            collaborators,
        }
    }

    /// Record an escalation and route it to the operator channel.
    pub async fn escalate(&self, worker: Option<&str>, kind: EscalationKind, message: String) {
        let escalation = match worker {
            Some(id) => Escalation::worker(id, kind, message),
            None => Escalation::phase(kind, message),
        };
        if let Err(e) = self.collaborators.escalation.notify(&escalation).await {
            warn!(kind = %kind, error = %e, "Failed to deliver escalation");
        }
        self.audit.record_escalation(escalation).await;
    }
}
