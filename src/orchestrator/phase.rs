//! One running phase: wave-by-wave launching, operator controls, sealing.

use crate::audit::{
    CloseMode, EscalationKind, OperatorAction, OperatorActionKind, PhaseArchive, WorkerRecord,
};
use crate::collaborators::IsolationHandle;
use crate::dag::Schedule;
use crate::errors::{OrchestratorError, WorkerError};
use crate::integration::{IntegrationCoordinator, IntegrationReport, IntegrationSettings};
use crate::lifecycle::WorkerState;
use crate::orchestrator::OrchestratorState;
use crate::poller::WorkerPoller;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Progress notifications for a running phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PhaseEvent {
    WaveStarted { wave: usize, workers: Vec<String> },
    WorkerLaunched { worker: String },
    LaunchFailed { worker: String, reason: String },
    WaveSettled { wave: usize },
    IntegrationFinished { successful: bool },
}

struct PollerTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PhaseRun {
    state: Arc<OrchestratorState>,
    schedule: Schedule,
    project: Option<String>,
    pollers: Mutex<HashMap<String, PollerTask>>,
    integration: Mutex<Option<IntegrationReport>>,
    sealed: AtomicBool,
    event_tx: Option<mpsc::Sender<PhaseEvent>>,
}

impl PhaseRun {
    pub fn new(
        state: Arc<OrchestratorState>,
        schedule: Schedule,
        project: Option<String>,
        event_tx: Option<mpsc::Sender<PhaseEvent>>,
    ) -> Self {
        Self {
            state,
            schedule,
            project,
            pollers: Mutex::new(HashMap::new()),
            integration: Mutex::new(None),
            sealed: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn phase(&self) -> u32 {
        self.state.phase
    }

    pub fn state(&self) -> &Arc<OrchestratorState> {
        &self.state
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Run every wave to a settled state, then integrate.
    ///
    /// Returns `None` when the phase was sealed before integration ran.
    pub async fn drive(&self) -> Result<Option<IntegrationReport>, OrchestratorError> {
        self.ensure_open()?;
        let mut changes = self.state.lifecycle.subscribe();

        for wave in self.schedule.waves() {
            info!(
                phase = self.phase(),
                wave = wave.index,
                workers = ?wave.workers,
                "Wave started"
            );
            self.emit(PhaseEvent::WaveStarted {
                wave: wave.index,
                workers: wave.workers.clone(),
            })
            .await;

            loop {
                if self.is_sealed() {
                    return Ok(None);
                }
                self.launch_ready(&wave.workers).await;
                if self.state.lifecycle.all_settled(&wave.workers).await {
                    break;
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }

            info!(phase = self.phase(), wave = wave.index, "Wave settled");
            self.emit(PhaseEvent::WaveSettled { wave: wave.index }).await;
        }

        self.stop_pollers().await;
        if self.is_sealed() {
            return Ok(None);
        }

        let report = self.integrate().await;
        *self.integration.lock().await = Some(report.clone());
        Ok(Some(report))
    }

    async fn launch_ready(&self, wave: &[String]) {
        let limit = self.state.config.toml.orchestrator.max_concurrent.max(1);
        for id in wave {
            if self.state.lifecycle.running_count().await >= limit {
                break;
            }
            if matches!(self.state.lifecycle.state(id).await, Ok(WorkerState::Ready)) {
                self.launch(id).await;
            }
        }
    }

    async fn launch(&self, id: &str) {
        if self.is_sealed() {
            return;
        }
        let lifecycle = &self.state.lifecycle;
        if let Err(e) = lifecycle.mark_starting(id).await {
            warn!(worker = %id, error = %e, "Launch skipped");
            return;
        }
        let Some(spec) = lifecycle.graph().spec_by_id(id).cloned() else {
            return;
        };

        let process = &self.state.collaborators.process;
        let handle = match process.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_launch(id, format!("failed to start: {e:#}")).await;
                return;
            }
        };
        // The phase may have been sealed while the process was starting
        if self.is_sealed() || lifecycle.attach_isolation(id, handle.clone(), None).await.is_err() {
            self.abandon_launch(id, &handle).await;
            return;
        }

        let workspace = match process.isolate(&handle).await {
            Ok(workspace) => workspace,
            Err(e) => {
                self.fail_launch(id, format!("failed to isolate: {e:#}")).await;
                return;
            }
        };
        if self.is_sealed()
            || lifecycle
                .attach_isolation(id, handle.clone(), Some(workspace.clone()))
                .await
                .is_err()
        {
            self.abandon_launch(id, &handle).await;
            return;
        }
        info!(worker = %id, handle = %handle, workspace = %workspace.display(), "Worker launched");

        {
            // seal drains under this lock, so a poller inserted here is always stopped
            let mut pollers = self.pollers.lock().await;
            if self.is_sealed() {
                drop(pollers);
                self.abandon_launch(id, &handle).await;
                return;
            }
            let cancel = CancellationToken::new();
            let task = WorkerPoller::new(id, handle, self.state.clone(), cancel.clone()).spawn();
            pollers.insert(id.to_string(), PollerTask { cancel, task });
        }
        self.emit(PhaseEvent::WorkerLaunched {
            worker: id.to_string(),
        })
        .await;
    }

    /// Release a process started after the phase stopped accepting launches.
    async fn abandon_launch(&self, id: &str, handle: &IsolationHandle) {
        warn!(worker = %id, handle = %handle, "Phase sealed during launch, stopping worker");
        if let Ok(state) = self.state.lifecycle.state(id).await
            && state.is_running()
            && let Err(e) = self
                .state
                .lifecycle
                .mark_failed(id, "phase closed before completion")
                .await
        {
            warn!(worker = %id, error = %e, "Failed to close worker");
        }
        if let Err(e) = self.state.collaborators.process.stop(handle).await {
            warn!(worker = %id, error = %e, "Failed to stop worker process");
        }
    }

    async fn fail_launch(&self, id: &str, reason: String) {
        match self.state.lifecycle.mark_failed(id, &reason).await {
            Ok(Some(handle)) => {
                if let Err(e) = self.state.collaborators.process.stop(&handle).await {
                    warn!(worker = %id, error = %e, "Failed to stop worker process");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(worker = %id, error = %e, "Failed to record launch failure"),
        }
        let error = WorkerError::Fatal {
            worker: id.to_string(),
            reason: reason.clone(),
        };
        self.state
            .escalate(Some(id), EscalationKind::WorkerFailed, error.to_string())
            .await;
        self.emit(PhaseEvent::LaunchFailed {
            worker: id.to_string(),
            reason,
        })
        .await;
    }

    async fn integrate(&self) -> IntegrationReport {
        let workers = self.state.lifecycle.snapshot_all().await;
        let coordinator = IntegrationCoordinator::new(
            self.state.collaborators.vcs.clone(),
            IntegrationSettings::from_config(&self.state.config),
        );
        let report = coordinator
            .integrate(self.phase(), self.schedule.waves(), &workers)
            .await;

        for conflict in &report.conflicts {
            self.state
                .escalate(
                    Some(&conflict.worker),
                    EscalationKind::MergeConflict,
                    conflict.to_string(),
                )
                .await;
        }
        for overlap in &report.overlaps {
            self.state
                .escalate(
                    None,
                    EscalationKind::PathOverlap,
                    format!(
                        "Workers '{}' and '{}' in wave {} changed {} shared path(s)",
                        overlap.workers[0],
                        overlap.workers[1],
                        overlap.wave,
                        overlap.paths.len()
                    ),
                )
                .await;
        }

        let successful = report.is_fully_successful();
        info!(phase = self.phase(), successful, "Integration finished");
        self.emit(PhaseEvent::IntegrationFinished { successful }).await;
        report
    }

    /// Operator cancellation: FAILED, handle released, dependents held.
    pub async fn cancel(&self, id: &str) -> Result<(), OrchestratorError> {
        self.ensure_open()?;
        let handle = self.state.lifecycle.cancel(id).await?;
        if let Some(poller) = self.pollers.lock().await.remove(id) {
            poller.cancel.cancel();
        }
        if let Some(handle) = handle
            && let Err(e) = self.state.collaborators.process.stop(&handle).await
        {
            warn!(worker = %id, error = %e, "Failed to stop cancelled worker");
        }
        self.state
            .audit
            .record_operator_action(OperatorAction::new(
                id,
                OperatorActionKind::Cancel,
                "cancelled by operator",
            ))
            .await;
        info!(worker = %id, "Worker cancelled");
        Ok(())
    }

    /// Forward operator input to a running worker and restart its escalation wait.
    pub async fn respond(&self, id: &str, input: &str) -> Result<(), OrchestratorError> {
        self.ensure_open()?;
        let runtime = self.state.lifecycle.snapshot(id).await?;
        let handle = match (&runtime.isolation_handle, runtime.state.is_running()) {
            (Some(handle), true) => handle.clone(),
            _ => {
                return Err(WorkerError::NotRunning {
                    worker: id.to_string(),
                    state: runtime.state,
                }
                .into());
            }
        };

        self.state
            .collaborators
            .process
            .send_input(&handle, input)
            .await?;
        self.state.lifecycle.record_operator_action(id).await?;
        self.state
            .audit
            .record_operator_action(OperatorAction::new(id, OperatorActionKind::Respond, input))
            .await;
        info!(worker = %id, "Operator response delivered");
        Ok(())
    }

    /// Seal the phase. Running workers are stopped and recorded as FAILED;
    /// workers that never launched stay outstanding.
    pub async fn seal(&self, close_mode: CloseMode) -> Result<PhaseArchive, OrchestratorError> {
        if self.sealed.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::PhaseSealed {
                phase: self.phase(),
            });
        }

        self.stop_pollers().await;
        for runtime in self.state.lifecycle.snapshot_all().await {
            if !runtime.state.is_running() {
                continue;
            }
            match self
                .state
                .lifecycle
                .mark_failed(runtime.id(), "phase closed before completion")
                .await
            {
                Ok(Some(handle)) => {
                    if let Err(e) = self.state.collaborators.process.stop(&handle).await {
                        warn!(worker = %runtime.id(), error = %e, "Failed to stop worker process");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(worker = %runtime.id(), error = %e, "Failed to close worker"),
            }
        }

        let workers = self
            .state
            .lifecycle
            .snapshot_all()
            .await
            .into_iter()
            .map(WorkerRecord::from)
            .collect();

        Ok(PhaseArchive {
            archive_id: Uuid::new_v4(),
            phase: self.phase(),
            project: self.project.clone(),
            started_at: self.state.started_at,
            sealed_at: Utc::now(),
            close_mode,
            waves: self.schedule.waves().to_vec(),
            workers,
            approvals: self.state.audit.approvals().await,
            escalations: self.state.audit.escalations().await,
            operator_actions: self.state.audit.operator_actions().await,
            integration: self.integration.lock().await.clone(),
        })
    }

    async fn stop_pollers(&self) {
        let pollers: Vec<(String, PollerTask)> = self.pollers.lock().await.drain().collect();
        for (id, poller) in pollers {
            poller.cancel.cancel();
            if let Err(e) = poller.task.await {
                warn!(worker = %id, error = %e, "Poller task ended abnormally");
            }
        }
    }

    fn ensure_open(&self) -> Result<(), OrchestratorError> {
        if self.is_sealed() {
            return Err(OrchestratorError::PhaseSealed {
                phase: self.phase(),
            });
        }
        Ok(())
    }

    async fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
