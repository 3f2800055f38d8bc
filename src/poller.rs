//! Output poller: one cancellable task per launched worker.
//!
//! Each tick reads the worker's output, and when it changed, parses markers
//! and hands the snapshot to the approval engine. Start and escalation
//! timers are checked on every tick.

use crate::approval::{ApprovalContext, ApprovalOutcome, PromptTracker};
use crate::audit::EscalationKind;
use crate::collaborators::IsolationHandle;
use crate::errors::WorkerError;
use crate::lifecycle::{BlockedReason, WorkerRuntime, WorkerState};
use crate::orchestrator::OrchestratorState;
use crate::signals::SignalParser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Whether the poller keeps going after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Continue,
    Done,
}

pub struct WorkerPoller {
    worker: String,
    handle: IsolationHandle,
    state: Arc<OrchestratorState>,
    cancel: CancellationToken,
    parser: SignalParser,
    tracker: PromptTracker,
    last_snapshot: Option<String>,
    read_failures: u32,
}

impl WorkerPoller {
    pub fn new(
        worker: &str,
        handle: IsolationHandle,
        state: Arc<OrchestratorState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker: worker.to_string(),
            handle,
            state,
            cancel,
            parser: SignalParser::new(worker),
            tracker: PromptTracker::new(),
            last_snapshot: None,
            read_failures: 0,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        let interval = self.state.config.toml.poller.interval();
        debug!(worker = %self.worker, "Poller started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.tick().await {
                Ok(Tick::Continue) => {}
                Ok(Tick::Done) => break,
                // Lost a race with the core; the next tick sees the new state
                Err(WorkerError::InvalidTransition { from, to, .. }) => {
                    debug!(worker = %self.worker, %from, %to, "Transition rejected");
                }
                Err(e) => {
                    warn!(worker = %self.worker, error = %e, "Poller stopped");
                    break;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        debug!(worker = %self.worker, "Poller finished");
    }

    async fn tick(&mut self) -> Result<Tick, WorkerError> {
        let runtime = self.state.lifecycle.snapshot(&self.worker).await?;
        if !runtime.state.is_running() {
            return Ok(Tick::Done);
        }

        let poller = &self.state.config.toml.poller;
        let read = tokio::time::timeout(
            poller.read_timeout(),
            self.state.collaborators.output.read_output(&self.handle),
        )
        .await;

        let snapshot = match read {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                self.on_read_failure(&runtime, e.to_string()).await?;
                return self.check_timers().await;
            }
            Err(_) => {
                self.on_read_failure(&runtime, "read timed out".to_string())
                    .await?;
                return self.check_timers().await;
            }
        };

        if self.read_failures > 0 {
            debug!(worker = %self.worker, failures = self.read_failures, "Output readable again");
            self.read_failures = 0;
            if runtime.state == WorkerState::Blocked
                && matches!(runtime.blocked_reason, Some(BlockedReason::PollFailure { .. }))
            {
                self.state.lifecycle.mark_active(&self.worker).await?;
            }
        }

        if self.last_snapshot.as_deref() != Some(snapshot.as_str()) {
            let tick = self.on_output(&snapshot).await?;
            self.last_snapshot = Some(snapshot);
            if tick == Tick::Done {
                return Ok(Tick::Done);
            }
        }

        self.check_timers().await
    }

    async fn on_read_failure(
        &mut self,
        runtime: &WorkerRuntime,
        message: String,
    ) -> Result<(), WorkerError> {
        self.read_failures += 1;
        let ceiling = self.state.config.toml.poller.read_retries.max(1);
        debug!(
            worker = %self.worker,
            attempt = self.read_failures,
            ceiling,
            error = %message,
            "Output read failed"
        );
        if self.read_failures != ceiling {
            return Ok(());
        }

        let error = WorkerError::PollFailure {
            worker: self.worker.clone(),
            attempts: self.read_failures,
            message,
        };
        if runtime.state != WorkerState::Blocked {
            self.state
                .lifecycle
                .mark_blocked(
                    &self.worker,
                    BlockedReason::PollFailure {
                        attempts: self.read_failures,
                    },
                )
                .await?;
        }
        self.state
            .escalate(Some(&self.worker), EscalationKind::PollFailure, error.to_string())
            .await;
        Ok(())
    }

    async fn on_output(&mut self, snapshot: &str) -> Result<Tick, WorkerError> {
        let signals = self.parser.parse(snapshot);
        if let Some(tokens) = signals.tokens {
            self.state.lifecycle.record_tokens(&self.worker, tokens).await?;
        }

        if let Some(reason) = signals.fatal_reason() {
            self.fail(reason.to_string()).await?;
            return Ok(Tick::Done);
        }

        let runtime = self.state.lifecycle.snapshot(&self.worker).await?;
        if runtime.state == WorkerState::Starting && !snapshot.trim().is_empty() {
            self.state.lifecycle.mark_active(&self.worker).await?;
        }

        let collaborators = &self.state.collaborators;
        let ctx = ApprovalContext {
            spec: &runtime.spec,
            workspace: runtime.workspace.as_deref(),
            handle: &self.handle,
            process: collaborators.process.as_ref(),
            output: collaborators.output.as_ref(),
            audit: &self.state.audit,
        };
        let outcome = self
            .state
            .engine
            .handle(&ctx, snapshot, &mut self.tracker)
            .await;

        let state = self.state.lifecycle.state(&self.worker).await?;
        match outcome {
            ApprovalOutcome::Escalated {
                signature, rule, ..
            } => {
                let error = WorkerError::AmbiguousPrompt {
                    worker: self.worker.clone(),
                    signature: signature.clone(),
                };
                self.block(state, BlockedReason::Escalated { signature }).await?;
                self.state
                    .escalate(
                        Some(&self.worker),
                        EscalationKind::PromptEscalated,
                        format!("{error} (rule {rule})"),
                    )
                    .await;
                Ok(Tick::Continue)
            }
            ApprovalOutcome::VerificationFailed {
                signature,
                attempts,
            } => {
                let error = WorkerError::VerificationFailure {
                    worker: self.worker.clone(),
                    signature: signature.clone(),
                    attempts,
                };
                self.block(state, BlockedReason::VerificationFailed { signature })
                    .await?;
                self.state
                    .escalate(
                        Some(&self.worker),
                        EscalationKind::VerificationFailed,
                        error.to_string(),
                    )
                    .await;
                Ok(Tick::Continue)
            }
            ApprovalOutcome::AlreadyHandled { .. } => Ok(Tick::Continue),
            ApprovalOutcome::NoPrompt | ApprovalOutcome::AutoApproved { .. } => {
                if state == WorkerState::Blocked {
                    info!(worker = %self.worker, "Prompt cleared, worker resumed");
                    self.state.lifecycle.mark_active(&self.worker).await?;
                }
                if signals.complete {
                    return self.complete().await;
                }
                Ok(Tick::Continue)
            }
        }
    }

    async fn block(&self, state: WorkerState, reason: BlockedReason) -> Result<(), WorkerError> {
        // Already blocked for an earlier reason: keep that one and its wait
        if state == WorkerState::Blocked {
            return Ok(());
        }
        self.state.lifecycle.mark_blocked(&self.worker, reason).await
    }

    async fn complete(&self) -> Result<Tick, WorkerError> {
        if self.state.lifecycle.state(&self.worker).await? == WorkerState::Starting {
            self.state.lifecycle.mark_active(&self.worker).await?;
        }
        let promoted = self.state.lifecycle.mark_complete(&self.worker).await?;
        if !promoted.is_empty() {
            info!(worker = %self.worker, ready = ?promoted, "Dependents ready");
        }
        if let Err(e) = self.state.collaborators.process.stop(&self.handle).await {
            warn!(worker = %self.worker, error = %e, "Failed to stop completed worker");
        }
        Ok(Tick::Done)
    }

    async fn fail(&self, reason: String) -> Result<(), WorkerError> {
        let handle = self.state.lifecycle.mark_failed(&self.worker, &reason).await?;
        let handle = handle.unwrap_or_else(|| self.handle.clone());
        if let Err(e) = self.state.collaborators.process.stop(&handle).await {
            warn!(worker = %self.worker, error = %e, "Failed to stop worker process");
        }
        let error = WorkerError::Fatal {
            worker: self.worker.clone(),
            reason,
        };
        self.state
            .escalate(Some(&self.worker), EscalationKind::WorkerFailed, error.to_string())
            .await;
        Ok(())
    }

    async fn check_timers(&self) -> Result<Tick, WorkerError> {
        let runtime = self.state.lifecycle.snapshot(&self.worker).await?;
        let Some(since) = runtime.waiting_since else {
            return Ok(Tick::Continue);
        };
        let waited = since.elapsed();
        let poller = &self.state.config.toml.poller;

        match runtime.state {
            WorkerState::Starting if waited >= poller.start_timeout() => {
                self.state
                    .lifecycle
                    .mark_blocked(&self.worker, BlockedReason::StartTimeout)
                    .await?;
                self.state
                    .escalate(
                        Some(&self.worker),
                        EscalationKind::StartTimeout,
                        format!(
                            "Worker '{}' produced no output within {}",
                            self.worker,
                            format_duration(poller.start_timeout())
                        ),
                    )
                    .await;
                Ok(Tick::Continue)
            }
            WorkerState::Blocked if waited >= poller.escalation_wait() => {
                self.fail(format!(
                    "no operator response within {}",
                    format_duration(poller.escalation_wait())
                ))
                .await?;
                Ok(Tick::Done)
            }
            _ => Ok(Tick::Continue),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{secs}s")
    } else {
        format!("{}m{}s", secs / 60, secs % 60)
    }
}
