//! Integration coordinator.
//!
//! Runs once every wave has settled. Waves are merged in order; a conflict
//! halts the remaining merges of its wave only. The resulting
//! [`IntegrationReport`] is sealed into the phase archive.

pub mod coordinator;
pub mod report;

pub use coordinator::{IntegrationCoordinator, IntegrationSettings};
pub use report::{
    DeliverableReport, DeliverableStatus, IntegrationReport, MergeRecord, MergeStatus,
    OwnershipWarning, PathOverlap,
};
