//! Approval decision engine.
//!
//! Turns a worker's output snapshot into at most one action: nothing, an
//! auto-approval that is verified by re-polling, or an escalation. Each
//! classification is recorded as exactly one `ApprovalEvent`.

use super::prompt::{DetectedPrompt, detect_prompt, extract_features, fingerprint};
use super::rules::{ActionClass, RuleAction, RuleDecision, RuleInput, evaluate};
use crate::audit::{ApprovalAction, ApprovalEvent, AuditLog};
use crate::collaborators::{IsolationHandle, OutputSource, WorkerProcess};
use crate::config::ApprovalSection;
use crate::worker::WorkerSpec;
use chrono::Utc;
use std::path::Path;
use tracing::{debug, info, warn};

/// Longest excerpt stored in an approval event.
const EXCERPT_LIMIT: usize = 2000;

/// A prompt with its class, signature and rule decision.
#[derive(Debug, Clone)]
pub struct Classification {
    pub prompt: DetectedPrompt,
    pub class: ActionClass,
    pub signature: String,
    pub decision: RuleDecision,
}

/// What happened to a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    NoPrompt,
    /// The prompt was answered and seen to clear
    AutoApproved { signature: String },
    Escalated {
        signature: String,
        rule: String,
        reason: String,
    },
    /// The response was sent but the prompt stayed on screen
    VerificationFailed { signature: String, attempts: u32 },
    /// Same prompt instance as the last one handled; nothing recorded
    AlreadyHandled { signature: String },
}

/// Per-worker memory of the prompt currently on screen.
#[derive(Debug, Default)]
pub struct PromptTracker {
    handled: Option<String>,
}

impl PromptTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> Option<&str> {
        self.handled.as_deref()
    }

    pub fn reset(&mut self) {
        self.handled = None;
    }
}

/// Everything the engine needs from the worker being polled.
pub struct ApprovalContext<'a> {
    pub spec: &'a WorkerSpec,
    pub workspace: Option<&'a Path>,
    pub handle: &'a IsolationHandle,
    pub process: &'a dyn WorkerProcess,
    pub output: &'a dyn OutputSource,
    pub audit: &'a AuditLog,
}

pub struct ApprovalEngine {
    config: ApprovalSection,
}

impl ApprovalEngine {
    pub fn new(config: ApprovalSection) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ApprovalSection {
        &self.config
    }

    /// Detect and classify a prompt without acting on it.
    pub fn classify(
        &self,
        snapshot: &str,
        spec: &WorkerSpec,
        workspace: Option<&Path>,
    ) -> Option<Classification> {
        let prompt = detect_prompt(snapshot, self.config.context_lines)?;
        let features = extract_features(&prompt, workspace);
        let class = ActionClass::classify(&prompt, &features);
        let decision = evaluate(
            &RuleInput {
                prompt: &prompt,
                features: &features,
                class,
                spec,
                protected_branches: &self.config.protected_branches,
            },
            self.config.auto_approve,
        );
        let signature = fingerprint(class.label(), &prompt);
        Some(Classification {
            prompt,
            class,
            signature,
            decision,
        })
    }

    /// Act on `snapshot` for the worker described by `ctx`.
    pub async fn handle(
        &self,
        ctx: &ApprovalContext<'_>,
        snapshot: &str,
        tracker: &mut PromptTracker,
    ) -> ApprovalOutcome {
        let worker = ctx.spec.id.as_str();
        let Some(classification) = self.classify(snapshot, ctx.spec, ctx.workspace) else {
            tracker.reset();
            return ApprovalOutcome::NoPrompt;
        };

        let signature = classification.signature.clone();
        if tracker.handled() == Some(signature.as_str()) {
            debug!(worker = %worker, signature = %signature, "Prompt already handled");
            return ApprovalOutcome::AlreadyHandled { signature };
        }
        tracker.handled = Some(signature.clone());

        let decision = &classification.decision;
        let response = classification.prompt.kind.affirmative_response();
        let response = match (decision.action, response) {
            (RuleAction::AutoApprove, Some(response)) => response,
            _ => {
                warn!(
                    worker = %worker,
                    signature = %signature,
                    rule = %decision.rule,
                    "Prompt escalated"
                );
                ctx.audit
                    .record_approval(event(worker, &classification, ApprovalAction::Escalate, false))
                    .await;
                return ApprovalOutcome::Escalated {
                    signature,
                    rule: decision.rule.to_string(),
                    reason: decision.reason.clone(),
                };
            }
        };

        info!(
            worker = %worker,
            signature = %signature,
            rule = %decision.rule,
            response = %response,
            "Auto-approving prompt"
        );
        let attempts = match ctx.process.send_input(ctx.handle, response).await {
            Ok(()) => match self.verify_cleared(ctx, &signature).await {
                Ok(()) => {
                    ctx.audit
                        .record_approval(event(
                            worker,
                            &classification,
                            ApprovalAction::AutoApprove,
                            true,
                        ))
                        .await;
                    tracker.reset();
                    return ApprovalOutcome::AutoApproved { signature };
                }
                Err(attempts) => attempts,
            },
            Err(e) => {
                warn!(worker = %worker, error = %e, "Failed to send approval response");
                0
            }
        };

        let mut escalation = event(worker, &classification, ApprovalAction::Escalate, false);
        escalation.rule = "verification_failed".to_string();
        escalation.reason = if attempts == 0 {
            format!(
                "{}; sending '{response}' failed",
                classification.decision.rule
            )
        } else {
            format!(
                "{}; sent '{response}' but prompt still present after {attempts} re-poll(s)",
                classification.decision.rule
            )
        };
        ctx.audit.record_approval(escalation).await;

        warn!(
            worker = %worker,
            signature = %signature,
            attempts,
            "Auto-approved prompt did not clear"
        );
        ApprovalOutcome::VerificationFailed {
            signature,
            attempts,
        }
    }

    /// Re-poll until the prompt with `signature` is gone. Returns the number
    /// of attempts made when it never clears.
    async fn verify_cleared(&self, ctx: &ApprovalContext<'_>, signature: &str) -> Result<(), u32> {
        let retries = self.config.verify_retries;
        for attempt in 1..=retries {
            tokio::time::sleep(self.config.verify_delay()).await;
            let read =
                tokio::time::timeout(self.config.verify_timeout(), ctx.output.read_output(ctx.handle))
                    .await;
            let snapshot = match read {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(e)) => {
                    debug!(worker = %ctx.spec.id, attempt, error = %e, "Verification read failed");
                    continue;
                }
                Err(_) => {
                    debug!(worker = %ctx.spec.id, attempt, "Verification read timed out");
                    continue;
                }
            };
            match self.classify(&snapshot, ctx.spec, ctx.workspace) {
                Some(c) if c.signature == signature => {
                    debug!(worker = %ctx.spec.id, attempt, "Prompt still present");
                }
                _ => return Ok(()),
            }
        }
        Err(retries)
    }
}

fn event(
    worker: &str,
    classification: &Classification,
    action: ApprovalAction,
    verified: bool,
) -> ApprovalEvent {
    let mut excerpt = classification.prompt.text();
    if excerpt.len() > EXCERPT_LIMIT {
        let mut cut = excerpt.len() - EXCERPT_LIMIT;
        while !excerpt.is_char_boundary(cut) {
            cut += 1;
        }
        excerpt = excerpt[cut..].to_string();
    }
    ApprovalEvent {
        worker_id: worker.to_string(),
        raw_snapshot_excerpt: excerpt,
        classified_signature: classification.signature.clone(),
        action_taken: action,
        verified,
        rule: classification.decision.rule.to_string(),
        reason: classification.decision.reason.clone(),
        timestamp: Utc::now(),
    }
}
