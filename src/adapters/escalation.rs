//! Escalation channel that logs and appends to a JSONL file.

use crate::audit::Escalation;
use crate::audit::log::append_jsonl;
use crate::collaborators::EscalationChannel;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::warn;

/// Escalations surface as warnings; `foreman run` prints them, and an
/// operator tailing the JSONL file sees them as they arrive.
pub struct LogEscalationChannel {
    jsonl: Option<PathBuf>,
}

impl LogEscalationChannel {
    pub fn new(jsonl: Option<PathBuf>) -> Self {
        Self { jsonl }
    }
}

#[async_trait]
impl EscalationChannel for LogEscalationChannel {
    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        warn!(
            worker = escalation.worker_id.as_deref().unwrap_or("-"),
            kind = %escalation.kind,
            "{}",
            escalation.message
        );
        if let Some(ref path) = self.jsonl {
            append_jsonl(path, escalation)?;
        }
        Ok(())
    }
}
