//! Orchestrator core.
//!
//! [`Orchestrator`] opens phases; each [`PhaseRun`] launches the READY
//! workers of one wave at a time up to the concurrency limit, waits on the
//! lifecycle change signal until the wave settles, integrates after the last
//! wave, and is finally sealed into a [`PhaseArchive`](crate::audit::PhaseArchive).

pub mod phase;
pub mod runner;
pub mod state;

pub use phase::{PhaseEvent, PhaseRun};
pub use runner::{Orchestrator, SealedPhase};
pub use state::{Collaborators, OrchestratorState};
