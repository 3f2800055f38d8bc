//! Merges completed worker branches into the integration target, wave by
//! wave, then checks deliverables against the merged tree.

use super::report::{
    DeliverableReport, DeliverableStatus, IntegrationReport, MergeRecord, MergeStatus,
    OwnershipWarning, PathOverlap,
};
use crate::collaborators::VersionControl;
use crate::config::{ForemanConfig, OverlapPolicy};
use crate::dag::ExecutionWave;
use crate::errors::MergeConflictError;
use crate::lifecycle::{WorkerRuntime, WorkerState};
use crate::worker::WorkerSpec;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Branch and policy settings for one integration run.
#[derive(Debug, Clone)]
pub struct IntegrationSettings {
    pub target_branch: String,
    pub branch_prefix: String,
    pub tag_prefix: String,
    pub overlap_policy: OverlapPolicy,
    pub tag_clean_runs: bool,
}

impl IntegrationSettings {
    pub fn from_config(config: &ForemanConfig) -> Self {
        let toml = &config.toml;
        Self {
            target_branch: toml.orchestrator.target_branch.clone(),
            branch_prefix: toml.orchestrator.branch_prefix.clone(),
            tag_prefix: toml.orchestrator.tag_prefix.clone(),
            overlap_policy: toml.integration.overlap_policy,
            tag_clean_runs: toml.integration.tag_clean_runs,
        }
    }

    pub fn tag_name(&self, phase: u32) -> String {
        format!("{}/phase-{}", self.tag_prefix, phase)
    }
}

pub struct IntegrationCoordinator {
    vcs: Arc<dyn VersionControl>,
    settings: IntegrationSettings,
}

impl IntegrationCoordinator {
    pub fn new(vcs: Arc<dyn VersionControl>, settings: IntegrationSettings) -> Self {
        Self { vcs, settings }
    }

    /// Integrate every wave in order. `workers` are the settled runtime
    /// records of the whole phase.
    pub async fn integrate(
        &self,
        phase: u32,
        waves: &[ExecutionWave],
        workers: &[WorkerRuntime],
    ) -> IntegrationReport {
        let mut report = IntegrationReport {
            target_branch: self.settings.target_branch.clone(),
            ..Default::default()
        };
        let by_id: HashMap<&str, &WorkerRuntime> =
            workers.iter().map(|w| (w.spec.id.as_str(), w)).collect();
        let specs: Vec<&WorkerSpec> = workers.iter().map(|w| &w.spec).collect();

        for wave in waves {
            let members: Vec<&WorkerRuntime> = wave
                .workers
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            self.integrate_wave(wave.index, &members, &specs, &mut report)
                .await;
        }

        for runtime in workers {
            report.deliverables.push(self.check_deliverables(&runtime.spec, &mut report.errors).await);
        }

        if self.settings.tag_clean_runs && report.is_fully_successful() {
            let tag = self.settings.tag_name(phase);
            match self.vcs.tag(&tag).await {
                Ok(()) => {
                    info!(tag = %tag, "Tagged clean integration");
                    report.tag = Some(tag);
                }
                Err(e) => report.errors.push(format!("Failed to create tag {tag}: {e:#}")),
            }
        }

        report
    }

    async fn integrate_wave(
        &self,
        wave: usize,
        members: &[&WorkerRuntime],
        specs: &[&WorkerSpec],
        report: &mut IntegrationReport,
    ) {
        let target = &self.settings.target_branch;
        let mut complete = Vec::new();
        for runtime in members {
            let branch = runtime.spec.branch_name(&self.settings.branch_prefix);
            if runtime.state == WorkerState::Complete {
                complete.push((runtime.spec.clone(), branch));
            } else {
                report.merges.push(MergeRecord {
                    wave,
                    worker: runtime.spec.id.clone(),
                    branch,
                    status: MergeStatus::NotComplete,
                });
            }
        }

        let mut changed: Vec<Vec<PathBuf>> = Vec::with_capacity(complete.len());
        for (spec, branch) in &complete {
            let paths = match self.vcs.changed_paths(branch, target).await {
                Ok(paths) => paths,
                Err(e) => {
                    report
                        .errors
                        .push(format!("Failed to list changes of {branch}: {e:#}"));
                    Vec::new()
                }
            };
            let outside: Vec<PathBuf> = paths.iter().filter(|p| !spec.owns(p)).cloned().collect();
            if !outside.is_empty() {
                warn!(worker = %spec.id, paths = outside.len(), "Changes outside owned paths");
                report.ownership_warnings.push(OwnershipWarning {
                    worker: spec.id.clone(),
                    paths: outside,
                });
            }
            changed.push(paths);
        }

        let mut excluded: HashSet<String> = HashSet::new();
        for i in 0..complete.len() {
            let left: HashSet<&PathBuf> = changed[i].iter().collect();
            for j in (i + 1)..complete.len() {
                let mut shared: Vec<PathBuf> = changed[j]
                    .iter()
                    .filter(|p| left.contains(p))
                    .cloned()
                    .collect();
                if shared.is_empty() {
                    continue;
                }
                shared.sort();
                let (a, b) = (&complete[i].0.id, &complete[j].0.id);
                warn!(wave, a = %a, b = %b, paths = shared.len(), "Workers changed the same paths");
                if self.settings.overlap_policy == OverlapPolicy::Fail {
                    excluded.insert(a.clone());
                    excluded.insert(b.clone());
                }
                report.overlaps.push(PathOverlap {
                    wave,
                    workers: [a.clone(), b.clone()],
                    paths: shared,
                });
            }
        }

        let mut halted = false;
        for (spec, branch) in complete {
            let status = if halted {
                MergeStatus::Halted
            } else if excluded.contains(&spec.id) {
                MergeStatus::SkippedOverlap
            } else {
                match self.vcs.merge(&branch, target).await {
                    Ok(outcome) if outcome.success => {
                        info!(worker = %spec.id, branch = %branch, target = %target, "Merged");
                        MergeStatus::Merged
                    }
                    Ok(outcome) => {
                        let owners = owners_of(&outcome.conflicts, specs);
                        let conflict = MergeConflictError {
                            wave,
                            worker: spec.id.clone(),
                            paths: outcome.conflicts,
                            owners,
                        };
                        warn!(worker = %spec.id, error = %conflict, "Integration halted for wave");
                        report.conflicts.push(conflict);
                        halted = true;
                        MergeStatus::Conflicted
                    }
                    Err(e) => {
                        report
                            .errors
                            .push(format!("Failed to merge {branch} into {target}: {e:#}"));
                        halted = true;
                        MergeStatus::Error
                    }
                }
            };
            report.merges.push(MergeRecord {
                wave,
                worker: spec.id.clone(),
                branch,
                status,
            });
        }
    }

    async fn check_deliverables(
        &self,
        spec: &WorkerSpec,
        errors: &mut Vec<String>,
    ) -> DeliverableReport {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        for path in &spec.deliverables {
            match self.vcs.path_exists(&self.settings.target_branch, path).await {
                Ok(true) => present.push(path.clone()),
                Ok(false) => missing.push(path.clone()),
                Err(e) => {
                    errors.push(format!("Failed to check {}: {e:#}", path.display()));
                    missing.push(path.clone());
                }
            }
        }
        DeliverableReport {
            worker: spec.id.clone(),
            status: DeliverableStatus::classify(present.len(), spec.deliverables.len()),
            present,
            missing,
        }
    }
}

/// Workers whose owned paths cover any of `paths`, in declaration order.
fn owners_of(paths: &[PathBuf], specs: &[&WorkerSpec]) -> Vec<String> {
    specs
        .iter()
        .filter(|spec| paths.iter().any(|p| spec.owns(p)))
        .map(|spec| spec.id.clone())
        .collect()
}
