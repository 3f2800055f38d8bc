//! Structured result of integrating a phase.

use crate::errors::MergeConflictError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Deliverable coverage of one worker against the merged tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliverableStatus {
    /// Every declared deliverable is present
    Complete,
    /// Some, not all, are present
    Partial,
    /// None is present
    Missing,
}

impl DeliverableStatus {
    pub fn classify(present: usize, declared: usize) -> Self {
        if present == declared {
            Self::Complete
        } else if present == 0 {
            Self::Missing
        } else {
            Self::Partial
        }
    }
}

impl fmt::Display for DeliverableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Complete => "COMPLETE",
            Self::Partial => "PARTIAL",
            Self::Missing => "MISSING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableReport {
    pub worker: String,
    pub status: DeliverableStatus,
    pub present: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Merged,
    Conflicted,
    /// Not merged: an earlier merge in the same wave conflicted
    Halted,
    /// Not merged: overlapping paths under the `fail` policy
    SkippedOverlap,
    /// Not merged: the worker did not reach COMPLETE
    NotComplete,
    /// The version-control collaborator returned an error
    Error,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Merged => "merged",
            Self::Conflicted => "conflicted",
            Self::Halted => "halted",
            Self::SkippedOverlap => "skipped (overlap)",
            Self::NotComplete => "not complete",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub wave: usize,
    pub worker: String,
    pub branch: String,
    pub status: MergeStatus,
}

/// Two workers of one wave changed the same paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverlap {
    pub wave: usize,
    pub workers: [String; 2],
    pub paths: Vec<PathBuf>,
}

/// Paths a worker changed outside its `owned_paths`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipWarning {
    pub worker: String,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationReport {
    pub target_branch: String,
    pub merges: Vec<MergeRecord>,
    pub conflicts: Vec<MergeConflictError>,
    pub overlaps: Vec<PathOverlap>,
    pub ownership_warnings: Vec<OwnershipWarning>,
    pub deliverables: Vec<DeliverableReport>,
    /// Tag created on the target after a clean integration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl IntegrationReport {
    /// Every worker merged cleanly and delivered everything it declared.
    pub fn is_fully_successful(&self) -> bool {
        self.conflicts.is_empty()
            && self.errors.is_empty()
            && self.merges.iter().all(|m| m.status == MergeStatus::Merged)
            && self
                .deliverables
                .iter()
                .all(|d| d.status == DeliverableStatus::Complete)
    }

    pub fn merged_count(&self) -> usize {
        self.merges
            .iter()
            .filter(|m| m.status == MergeStatus::Merged)
            .count()
    }

    pub fn deliverable(&self, worker: &str) -> Option<&DeliverableReport> {
        self.deliverables.iter().find(|d| d.worker == worker)
    }

    /// Multi-line human summary.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Integration into {}: {}/{} merged",
            self.target_branch,
            self.merged_count(),
            self.merges.len()
        )];
        for merge in self.merges.iter().filter(|m| m.status != MergeStatus::Merged) {
            lines.push(format!("  {} (wave {}): {}", merge.worker, merge.wave, merge.status));
        }
        for conflict in &self.conflicts {
            let paths: Vec<String> = conflict.paths.iter().map(|p| p.display().to_string()).collect();
            lines.push(format!(
                "  conflict: {} [{}] owners: {}",
                conflict.worker,
                paths.join(", "),
                if conflict.owners.is_empty() {
                    "none".to_string()
                } else {
                    conflict.owners.join(", ")
                }
            ));
        }
        for overlap in &self.overlaps {
            lines.push(format!(
                "  overlap in wave {}: {} and {} ({} path(s))",
                overlap.wave,
                overlap.workers[0],
                overlap.workers[1],
                overlap.paths.len()
            ));
        }
        for warning in &self.ownership_warnings {
            lines.push(format!(
                "  {} changed {} path(s) outside owned_paths",
                warning.worker,
                warning.paths.len()
            ));
        }
        for d in &self.deliverables {
            lines.push(format!("  deliverables {}: {}", d.worker, d.status));
        }
        if let Some(tag) = &self.tag {
            lines.push(format!("  tagged {tag}"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliverable_classification() {
        assert_eq!(DeliverableStatus::classify(0, 0), DeliverableStatus::Complete);
        assert_eq!(DeliverableStatus::classify(2, 2), DeliverableStatus::Complete);
        assert_eq!(DeliverableStatus::classify(1, 2), DeliverableStatus::Partial);
        assert_eq!(DeliverableStatus::classify(0, 2), DeliverableStatus::Missing);
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&DeliverableStatus::Partial).unwrap();
        assert_eq!(json, "\"PARTIAL\"");
    }

    #[test]
    fn test_missing_deliverable_is_not_successful() {
        let report = IntegrationReport {
            target_branch: "main".into(),
            merges: vec![MergeRecord {
                wave: 0,
                worker: "api".into(),
                branch: "foreman/api".into(),
                status: MergeStatus::Merged,
            }],
            deliverables: vec![DeliverableReport {
                worker: "api".into(),
                status: DeliverableStatus::Missing,
                present: vec![],
                missing: vec![PathBuf::from("docs/api.md")],
            }],
            ..Default::default()
        };
        assert!(!report.is_fully_successful());
        assert!(report.summary().contains("deliverables api: MISSING"));
    }

    #[test]
    fn test_empty_report_is_successful() {
        assert!(IntegrationReport::default().is_fully_successful());
    }
}
