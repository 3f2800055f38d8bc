//! Phase setup, controls and termination modes.

use super::phase::{PhaseEvent, PhaseRun};
use super::state::{Collaborators, OrchestratorState};
use crate::audit::{CloseMode, PhaseArchive};
use crate::config::ForemanConfig;
use crate::dag::Schedule;
use crate::errors::OrchestratorError;
use crate::worker::WorkerSpec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// A sealed phase together with where it was persisted.
#[derive(Debug, Clone)]
pub struct SealedPhase {
    pub archive: PhaseArchive,
    pub location: String,
}

pub struct Orchestrator {
    config: Arc<ForemanConfig>,
    collaborators: Collaborators,
    current: Option<Arc<PhaseRun>>,
    last_phase: Option<u32>,
    event_tx: Option<mpsc::Sender<PhaseEvent>>,
}

impl Orchestrator {
    pub fn new(config: ForemanConfig, collaborators: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collaborators,
            current: None,
            last_phase: None,
            event_tx: None,
        }
    }

    /// Forward phase progress events to `tx`.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PhaseEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    /// The phase currently open, if any.
    pub fn current(&self) -> Option<Arc<PhaseRun>> {
        self.current.clone()
    }

    /// Validate `specs`, resolve them into waves and open a new phase.
    ///
    /// Configuration and cycle errors abort here, before any worker launches.
    pub async fn prepare(
        &mut self,
        specs: Vec<WorkerSpec>,
        project: Option<String>,
    ) -> Result<Arc<PhaseRun>, OrchestratorError> {
        if self.current.is_some() {
            return Err(OrchestratorError::PhaseInProgress);
        }

        let schedule = Schedule::resolve(specs)?;
        let phase = self.next_phase_number().await?;
        info!(
            phase,
            workers = schedule.worker_count(),
            waves = schedule.waves().len(),
            "Phase prepared"
        );

        let state = Arc::new(OrchestratorState::new(
            self.config.clone(),
            self.collaborators.clone(),
            schedule.graph().clone(),
            phase,
        ));
        let run = Arc::new(PhaseRun::new(state, schedule, project, self.event_tx.clone()));
        self.current = Some(run.clone());
        Ok(run)
    }

    /// Prepare, drive every wave, integrate, and close the phase.
    pub async fn run(
        &mut self,
        specs: Vec<WorkerSpec>,
        project: Option<String>,
    ) -> Result<SealedPhase, OrchestratorError> {
        let run = self.prepare(specs, project).await?;
        run.drive().await?;
        self.close_phase().await
    }

    pub async fn cancel(&self, worker: &str) -> Result<(), OrchestratorError> {
        self.active()?.cancel(worker).await
    }

    pub async fn respond(&self, worker: &str, input: &str) -> Result<(), OrchestratorError> {
        self.active()?.respond(worker, input).await
    }

    /// Archive the current phase and reset for a new schedule. Configuration
    /// and collaborators are kept.
    pub async fn close_phase(&mut self) -> Result<SealedPhase, OrchestratorError> {
        let sealed = self.seal_current(CloseMode::PhaseClose).await?;
        info!(phase = sealed.archive.phase, location = %sealed.location, "Phase closed");
        Ok(sealed)
    }

    /// Archive the current phase, if any, and tear everything down.
    pub async fn closeout(mut self) -> Result<Option<SealedPhase>, OrchestratorError> {
        if self.current.is_none() {
            info!("Closeout with no open phase");
            return Ok(None);
        }
        let sealed = self.seal_current(CloseMode::Closeout).await?;
        info!(phase = sealed.archive.phase, location = %sealed.location, "Closeout complete");
        Ok(Some(sealed))
    }

    async fn seal_current(&mut self, mode: CloseMode) -> Result<SealedPhase, OrchestratorError> {
        let run = self.current.take().ok_or(OrchestratorError::NoActivePhase)?;
        let archive = run.seal(mode).await?;
        let location = self
            .collaborators
            .archive
            .save(&archive)
            .await
            .map_err(OrchestratorError::Archive)?;
        self.last_phase = Some(archive.phase);
        Ok(SealedPhase { archive, location })
    }

    fn active(&self) -> Result<&Arc<PhaseRun>, OrchestratorError> {
        self.current.as_ref().ok_or(OrchestratorError::NoActivePhase)
    }

    async fn next_phase_number(&self) -> Result<u32, OrchestratorError> {
        let stored = self
            .collaborators
            .archive
            .latest_phase()
            .await
            .map_err(OrchestratorError::Archive)?;
        Ok(stored.max(self.last_phase).map_or(1, |n| n + 1))
    }
}
