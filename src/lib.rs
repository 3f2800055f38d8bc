pub mod adapters;
pub mod approval;
pub mod audit;
pub mod brief;
pub mod collaborators;
pub mod config;
pub mod dag;
pub mod errors;
pub mod integration;
pub mod lifecycle;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod signals;
pub mod worker;

#[cfg(test)]
mod testing;

pub use errors::{ConfigError, CycleError, OrchestratorError, ResolveError, WorkerError};
pub use orchestrator::{Orchestrator, PhaseEvent, SealedPhase};
pub use worker::{WorkerSpec, WorkersManifest};
