//! Append-only in-memory audit log for a running phase, with an optional
//! JSONL mirror of approval decisions.

use super::{ApprovalEvent, Escalation, OperatorAction};
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Default)]
struct Entries {
    approvals: Vec<ApprovalEvent>,
    escalations: Vec<Escalation>,
    operator_actions: Vec<OperatorAction>,
}

pub struct AuditLog {
    entries: Mutex<Entries>,
    decisions_jsonl: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(decisions_jsonl: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            decisions_jsonl,
        }
    }

    /// In-memory only.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub async fn record_approval(&self, event: ApprovalEvent) {
        if let Some(path) = &self.decisions_jsonl
            && let Err(e) = append_jsonl(path, &event)
        {
            warn!(path = %path.display(), error = %e, "Failed to mirror approval event");
        }
        self.entries.lock().await.approvals.push(event);
    }

    pub async fn record_escalation(&self, escalation: Escalation) {
        self.entries.lock().await.escalations.push(escalation);
    }

    pub async fn record_operator_action(&self, action: OperatorAction) {
        self.entries.lock().await.operator_actions.push(action);
    }

    pub async fn approvals(&self) -> Vec<ApprovalEvent> {
        self.entries.lock().await.approvals.clone()
    }

    pub async fn escalations(&self) -> Vec<Escalation> {
        self.entries.lock().await.escalations.clone()
    }

    pub async fn operator_actions(&self) -> Vec<OperatorAction> {
        self.entries.lock().await.operator_actions.clone()
    }

    pub async fn approvals_for(&self, worker: &str) -> Vec<ApprovalEvent> {
        self.entries
            .lock()
            .await
            .approvals
            .iter()
            .filter(|e| e.worker_id == worker)
            .cloned()
            .collect()
    }
}

/// Append one JSON line to `path`, creating parent directories as needed.
pub fn append_jsonl<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let line = serde_json::to_string(value).context("Failed to serialize log entry")?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", line).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
