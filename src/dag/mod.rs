//! Dependency resolution for worker declarations.
//!
//! Turns a list of `WorkerSpec`s into ordered, parallel-safe execution waves.
//!
//! ## Architecture
//!
//! 1. **Builder** - validates the declarations and constructs the graph
//! 2. **Scheduler** - peels the graph into waves
//!
//! ## Example
//!
//! ```
//! use foreman::dag::Schedule;
//! use foreman::worker::WorkerSpec;
//!
//! let specs = vec![
//!     WorkerSpec::new("a", "schema", vec![]),
//!     WorkerSpec::new("b", "fixtures", vec![]),
//!     WorkerSpec::new("c", "api", vec!["a".to_string(), "b".to_string()]),
//! ];
//!
//! let schedule = Schedule::resolve(specs).unwrap();
//! assert_eq!(schedule.waves()[0].workers, vec!["a", "b"]);
//! assert_eq!(schedule.waves()[1].workers, vec!["c"]);
//! ```

mod builder;
mod scheduler;

pub use builder::{DagBuilder, DependencyGraph, WorkerIndex};
pub use scheduler::{ExecutionWave, Schedule, compute_waves};
