//! Worker lifecycle: the per-worker state machine and the manager that owns
//! every runtime record.
//!
//! ```text
//! PENDING -> READY -> STARTING -> ACTIVE <-> BLOCKED
//!                                   |
//!                                   +-> COMPLETE
//! ```
//!
//! STARTING may also move to BLOCKED (start timeout). Any non-terminal
//! state may move to FAILED.

mod manager;
mod state;

pub use manager::{LifecycleManager, SharedRuntime};
pub use state::{BlockedReason, TransitionRecord, WorkerRuntime, WorkerState};
