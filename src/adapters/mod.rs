//! Concrete collaborators: tmux workers, git2 integration, and a logging
//! escalation channel. The filesystem archive store lives in
//! `crate::audit::archive`.

pub mod escalation;
pub mod git;
pub mod tmux;

pub use escalation::LogEscalationChannel;
pub use git::GitWorkspace;
pub use tmux::TmuxProcess;
