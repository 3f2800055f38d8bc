//! Approval decision engine: prompt detection, an ordered rule table, and
//! verified auto-responses.
//!
//! ```text
//! snapshot ─▶ detect_prompt ─▶ extract_features ─▶ ActionClass ─▶ rules::evaluate
//!                                                                   │
//!                               ┌───────────────────────────────────┤
//!                               ▼                                   ▼
//!                       send "y"/"1", re-poll                   escalate
//!                       cleared? ─ no ─▶ escalate once
//! ```

pub mod engine;
pub mod prompt;
pub mod rules;

pub use engine::{ApprovalContext, ApprovalEngine, ApprovalOutcome, Classification, PromptTracker};
pub use prompt::{DetectedPrompt, PromptFeatures, PromptKind, detect_prompt, extract_features};
pub use rules::{ActionClass, RULES, Rule, RuleAction, RuleDecision};
