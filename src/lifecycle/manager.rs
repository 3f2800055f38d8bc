//! Owner of every worker's runtime record.
//!
//! Each record sits behind its own `tokio::sync::Mutex`, so a poller-driven
//! ACTIVE/BLOCKED move and an orchestrator-driven terminal move on the same
//! worker are serialized. Locks are taken one worker at a time. Every
//! successful transition bumps a `watch` counter.

use crate::collaborators::IsolationHandle;
use crate::dag::DependencyGraph;
use crate::errors::WorkerError;
use crate::lifecycle::state::{BlockedReason, WorkerRuntime, WorkerState};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{info, warn};

pub type SharedRuntime = Arc<Mutex<WorkerRuntime>>;

pub struct LifecycleManager {
    graph: DependencyGraph,
    workers: HashMap<String, SharedRuntime>,
    changes: watch::Sender<u64>,
}

impl LifecycleManager {
    /// Create a PENDING record for every worker and promote the roots to READY.
    pub fn new(graph: DependencyGraph) -> Self {
        let mut workers = HashMap::new();
        for spec in graph.specs() {
            let mut runtime = WorkerRuntime::new(spec.clone());
            if spec.dependencies.is_empty() {
                // Pending -> Ready is always allowed on a fresh record
                let _ = runtime.transition(WorkerState::Ready, Some("no dependencies".into()));
            }
            workers.insert(spec.id.clone(), Arc::new(Mutex::new(runtime)));
        }

        let (changes, _) = watch::channel(0);
        Self {
            graph,
            workers,
            changes,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Receiver notified after every transition.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn runtime(&self, id: &str) -> Result<SharedRuntime, WorkerError> {
        self.workers
            .get(id)
            .cloned()
            .ok_or_else(|| WorkerError::UnknownWorker {
                worker: id.to_string(),
            })
    }

    pub async fn state(&self, id: &str) -> Result<WorkerState, WorkerError> {
        Ok(self.runtime(id)?.lock().await.state)
    }

    pub async fn snapshot(&self, id: &str) -> Result<WorkerRuntime, WorkerError> {
        Ok(self.runtime(id)?.lock().await.clone())
    }

    /// Copies of every record, in declaration order.
    pub async fn snapshot_all(&self) -> Vec<WorkerRuntime> {
        let mut result = Vec::with_capacity(self.workers.len());
        for spec in self.graph.specs() {
            if let Some(rt) = self.workers.get(&spec.id) {
                result.push(rt.lock().await.clone());
            }
        }
        result
    }

    /// Workers currently holding a launch slot.
    pub async fn running_count(&self) -> usize {
        let mut count = 0;
        for rt in self.workers.values() {
            if rt.lock().await.state.is_running() {
                count += 1;
            }
        }
        count
    }

    pub async fn all_settled(&self, ids: &[String]) -> bool {
        for id in ids {
            match self.workers.get(id) {
                Some(rt) if rt.lock().await.is_settled() => {}
                _ => return false,
            }
        }
        true
    }

    /// READY -> STARTING.
    pub async fn mark_starting(&self, id: &str) -> Result<(), WorkerError> {
        self.apply(id, WorkerState::Starting, None).await
    }

    /// Record the handle and workspace issued by the process collaborator.
    pub async fn attach_isolation(
        &self,
        id: &str,
        handle: IsolationHandle,
        workspace: Option<PathBuf>,
    ) -> Result<(), WorkerError> {
        let rt = self.runtime(id)?;
        let mut rt = rt.lock().await;
        if !rt.state.is_running() {
            return Err(WorkerError::NotRunning {
                worker: id.to_string(),
                state: rt.state,
            });
        }
        rt.isolation_handle = Some(handle);
        if workspace.is_some() {
            rt.workspace = workspace;
        }
        Ok(())
    }

    /// STARTING or BLOCKED -> ACTIVE.
    pub async fn mark_active(&self, id: &str) -> Result<(), WorkerError> {
        self.apply(id, WorkerState::Active, None).await
    }

    /// STARTING or ACTIVE -> BLOCKED.
    pub async fn mark_blocked(&self, id: &str, reason: BlockedReason) -> Result<(), WorkerError> {
        let note = reason.to_string();
        let rt = self.runtime(id)?;
        {
            let mut guard = rt.lock().await;
            guard.transition(WorkerState::Blocked, Some(note))?;
            guard.blocked_reason = Some(reason.clone());
        }
        warn!(worker = %id, reason = %reason, "Worker blocked");
        self.notify();
        Ok(())
    }

    /// ACTIVE -> COMPLETE, then promote dependents whose dependencies are all complete.
    pub async fn mark_complete(&self, id: &str) -> Result<Vec<String>, WorkerError> {
        self.apply(id, WorkerState::Complete, None).await?;
        Ok(self.promote_dependents(id).await)
    }

    /// Any non-terminal state -> FAILED. Returns the released isolation handle
    /// so the caller can stop the process. Dependents are held transitively.
    pub async fn mark_failed(
        &self,
        id: &str,
        reason: &str,
    ) -> Result<Option<IsolationHandle>, WorkerError> {
        let rt = self.runtime(id)?;
        let handle = {
            let mut guard = rt.lock().await;
            guard.transition(WorkerState::Failed, Some(reason.to_string()))?;
            guard.failure = Some(reason.to_string());
            guard.isolation_handle.take()
        };
        warn!(worker = %id, reason = %reason, "Worker failed");
        self.hold_dependents(id).await;
        self.notify();
        Ok(handle)
    }

    /// Operator cancellation.
    pub async fn cancel(&self, id: &str) -> Result<Option<IsolationHandle>, WorkerError> {
        self.record_operator_action(id).await?;
        self.mark_failed(id, "cancelled by operator").await
    }

    /// Note an operator action and restart the escalation wait.
    pub async fn record_operator_action(&self, id: &str) -> Result<(), WorkerError> {
        let rt = self.runtime(id)?;
        let mut rt = rt.lock().await;
        rt.last_operator_action = Some(Utc::now());
        if rt.state == WorkerState::Blocked {
            rt.waiting_since = Some(Instant::now());
        }
        Ok(())
    }

    /// Record token usage. Only the maximum observed value is kept; passing
    /// the high estimate is logged once.
    pub async fn record_tokens(&self, id: &str, tokens: u64) -> Result<(), WorkerError> {
        let rt = self.runtime(id)?;
        let mut rt = rt.lock().await;
        if tokens <= rt.tokens_consumed {
            return Ok(());
        }
        rt.tokens_consumed = tokens;
        if !rt.budget_warned && rt.spec.token_budget.is_exceeded_by(tokens) {
            rt.budget_warned = true;
            warn!(
                worker = %id,
                consumed = tokens,
                high = rt.spec.token_budget.high,
                "Worker exceeded its token budget"
            );
        }
        Ok(())
    }

    async fn apply(
        &self,
        id: &str,
        to: WorkerState,
        note: Option<String>,
    ) -> Result<(), WorkerError> {
        let rt = self.runtime(id)?;
        let from = {
            let mut guard = rt.lock().await;
            let from = guard.state;
            guard.transition(to, note)?;
            from
        };
        info!(worker = %id, from = %from, to = %to, "Worker transition");
        self.notify();
        Ok(())
    }

    async fn promote_dependents(&self, id: &str) -> Vec<String> {
        let mut promoted = Vec::new();
        for dependent in self.graph.dependent_ids(id) {
            if !self.dependencies_complete(&dependent).await {
                continue;
            }
            let Some(rt) = self.workers.get(&dependent) else {
                continue;
            };
            let mut guard = rt.lock().await;
            // Another completing dependency may have promoted it already
            if guard.state != WorkerState::Pending || guard.blocked_reason.is_some() {
                continue;
            }
            if guard
                .transition(WorkerState::Ready, Some(format!("dependencies complete ({id} last)")))
                .is_ok()
            {
                info!(worker = %dependent, "Worker ready");
                promoted.push(dependent.clone());
            }
        }
        if !promoted.is_empty() {
            self.notify();
        }
        promoted
    }

    async fn dependencies_complete(&self, id: &str) -> bool {
        for dep in self.graph.dependency_ids(id) {
            match self.workers.get(&dep) {
                Some(rt) if rt.lock().await.state == WorkerState::Complete => {}
                _ => return false,
            }
        }
        true
    }

    async fn hold_dependents(&self, failed: &str) {
        for dependent in self.graph.transitive_dependents(failed) {
            let Some(rt) = self.workers.get(&dependent) else {
                continue;
            };
            let mut guard = rt.lock().await;
            if guard.state == WorkerState::Pending && guard.blocked_reason.is_none() {
                guard.blocked_reason = Some(BlockedReason::UpstreamFailed {
                    dependency: failed.to_string(),
                });
                warn!(worker = %dependent, upstream = %failed, "Worker held by upstream failure");
            }
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}
