//! The ordered approval rule table.
//!
//! Rules are evaluated top to bottom and the first match wins. The last
//! rule matches everything and escalates, so an unrecognized prompt can
//! never be auto-approved.

use super::prompt::{DetectedPrompt, PromptFeatures};
use crate::worker::WorkerSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary action class of a prompt, by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Destructive,
    Credential,
    Push,
    FileEdit,
    TestRun,
    LocalCommit,
    Question,
    Unknown,
}

impl ActionClass {
    pub fn classify(prompt: &DetectedPrompt, features: &PromptFeatures) -> Self {
        if features.destructive {
            Self::Destructive
        } else if features.credential {
            Self::Credential
        } else if features.push {
            Self::Push
        } else if features.file_edit {
            Self::FileEdit
        } else if features.test_run {
            Self::TestRun
        } else if features.local_commit {
            Self::LocalCommit
        } else if !prompt.kind.is_binary() {
            Self::Question
        } else {
            Self::Unknown
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Destructive => "destructive",
            Self::Credential => "credential",
            Self::Push => "push",
            Self::FileEdit => "file_edit",
            Self::TestRun => "test_run",
            Self::LocalCommit => "local_commit",
            Self::Question => "question",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    AutoApprove,
    Escalate,
}

/// Everything a rule may look at.
pub struct RuleInput<'a> {
    pub prompt: &'a DetectedPrompt,
    pub features: &'a PromptFeatures,
    pub class: ActionClass,
    pub spec: &'a WorkerSpec,
    pub protected_branches: &'a [String],
}

impl RuleInput<'_> {
    fn edits_confined_to_owned_paths(&self) -> bool {
        !self.features.paths.is_empty() && self.features.paths.iter().all(|p| self.spec.owns(p))
    }

    fn pushes_to_protected_target(&self) -> bool {
        match &self.features.push_target {
            Some(target) => self.protected_branches.iter().any(|b| {
                target == b || target.rsplit('/').next() == Some(b.as_str())
            }),
            // An unreadable target is treated as protected
            None => true,
        }
    }
}

pub struct Rule {
    pub name: &'static str,
    pub action: RuleAction,
    pub description: &'static str,
    matches: fn(&RuleInput<'_>) -> bool,
}

impl Rule {
    pub fn matches(&self, input: &RuleInput<'_>) -> bool {
        (self.matches)(input)
    }
}

/// The result of running the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDecision {
    pub rule: &'static str,
    pub action: RuleAction,
    pub reason: String,
}

pub static RULES: &[Rule] = &[
    Rule {
        name: "destructive_action",
        action: RuleAction::Escalate,
        description: "deletion, forced overwrite, hard reset, drop or truncate",
        matches: |i| i.class == ActionClass::Destructive,
    },
    Rule {
        name: "credential_change",
        action: RuleAction::Escalate,
        description: "secret or credential modification",
        matches: |i| i.class == ActionClass::Credential,
    },
    Rule {
        name: "protected_push",
        action: RuleAction::Escalate,
        description: "push to a protected branch",
        matches: |i| i.class == ActionClass::Push && i.pushes_to_protected_target(),
    },
    Rule {
        name: "scope_exceeding_edit",
        action: RuleAction::Escalate,
        description: "file edit outside the worker's owned paths",
        matches: |i| {
            i.class == ActionClass::FileEdit
                && i.features.paths.iter().any(|p| !i.spec.owns(p))
        },
    },
    Rule {
        name: "owned_file_edit",
        action: RuleAction::AutoApprove,
        description: "confirmation of an edit confined to owned paths",
        matches: |i| {
            i.prompt.kind.is_binary()
                && i.class == ActionClass::FileEdit
                && i.edits_confined_to_owned_paths()
        },
    },
    Rule {
        name: "test_run",
        action: RuleAction::AutoApprove,
        description: "confirmation of a test run",
        matches: |i| i.prompt.kind.is_binary() && i.class == ActionClass::TestRun,
    },
    Rule {
        name: "local_commit",
        action: RuleAction::AutoApprove,
        description: "confirmation of a local commit",
        matches: |i| i.prompt.kind.is_binary() && i.class == ActionClass::LocalCommit,
    },
    Rule {
        name: "fail_closed",
        action: RuleAction::Escalate,
        description: "anything not matched above",
        matches: |_| true,
    },
];

/// Run the rule table. With `auto_approve` off, approving rules escalate.
pub fn evaluate(input: &RuleInput<'_>, auto_approve: bool) -> RuleDecision {
    for rule in RULES {
        if !rule.matches(input) {
            continue;
        }
        return match rule.action {
            RuleAction::AutoApprove if !auto_approve => RuleDecision {
                rule: rule.name,
                action: RuleAction::Escalate,
                reason: format!("{} (auto-approval disabled)", rule.description),
            },
            action => RuleDecision {
                rule: rule.name,
                action,
                reason: rule.description.to_string(),
            },
        };
    }

    // The table ends with a catch-all; keep the fail-closed result explicit anyway
    RuleDecision {
        rule: "fail_closed",
        action: RuleAction::Escalate,
        reason: "no rule matched".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::prompt::{detect_prompt, extract_features};

    fn decide(snapshot: &str, spec: &WorkerSpec, auto_approve: bool) -> RuleDecision {
        let prompt = detect_prompt(snapshot, 10).unwrap();
        let features = extract_features(&prompt, None);
        let class = ActionClass::classify(&prompt, &features);
        let protected = vec!["main".to_string(), "master".to_string()];
        evaluate(
            &RuleInput {
                prompt: &prompt,
                features: &features,
                class,
                spec,
                protected_branches: &protected,
            },
            auto_approve,
        )
    }

    fn api_worker() -> WorkerSpec {
        WorkerSpec::new("api", "backend", vec![]).with_owned_paths(&["src/api/", "tests/api/"])
    }

    #[test]
    fn test_table_ends_with_catch_all() {
        let last = RULES.last().unwrap();
        assert_eq!(last.name, "fail_closed");
        assert_eq!(last.action, RuleAction::Escalate);
    }

    #[test]
    fn test_owned_overwrite_auto_approves() {
        let d = decide(
            "Writing src/api/routes.rs\nOverwrite file? (y/n)",
            &api_worker(),
            true,
        );
        assert_eq!(d.rule, "owned_file_edit");
        assert_eq!(d.action, RuleAction::AutoApprove);
    }

    #[test]
    fn test_force_push_escalates_even_for_owned_paths() {
        let worker = WorkerSpec::new("ops", "release", vec![]).with_owned_paths(&["**"]);
        let d = decide("Force push to main? (y/n)", &worker, true);
        assert_eq!(d.rule, "destructive_action");
        assert_eq!(d.action, RuleAction::Escalate);
    }

    #[test]
    fn test_deletion_escalates() {
        let d = decide("rm -rf src/api/old\nRun this command? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "destructive_action");
    }

    #[test]
    fn test_credential_escalates() {
        let d = decide("Update .env with the new password? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "credential_change");
    }

    #[test]
    fn test_push_to_protected_and_unprotected() {
        let d = decide("$ git push origin main\nRun this command? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "protected_push");

        // Not protected, but pushes are never auto-approved either
        let d = decide(
            "$ git push origin feature/api\nRun this command? (y/n)",
            &api_worker(),
            true,
        );
        assert_eq!(d.rule, "fail_closed");
        assert_eq!(d.action, RuleAction::Escalate);
    }

    #[test]
    fn test_edit_outside_owned_paths_escalates() {
        let d = decide(
            "Edit src/ui/app.tsx\nDo you want to make this edit?",
            &api_worker(),
            true,
        );
        assert_eq!(d.rule, "scope_exceeding_edit");
    }

    #[test]
    fn test_edit_without_paths_falls_through() {
        let d = decide("Overwrite file? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "fail_closed");
    }

    #[test]
    fn test_test_run_and_commit_auto_approve() {
        let d = decide("Bash: cargo test -p api\nProceed? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "test_run");
        assert_eq!(d.action, RuleAction::AutoApprove);

        let d = decide("Bash: git commit -m 'api routes'\n❯ 1. Yes\n  2. No", &api_worker(), true);
        assert_eq!(d.rule, "local_commit");
    }

    #[test]
    fn test_drop_with_qualifiers_is_destructive() {
        let d = decide("Should I drop the legacy table? (y/n)", &api_worker(), true);
        assert_eq!(d.rule, "destructive_action");
        assert_eq!(d.action, RuleAction::Escalate);
    }

    #[test]
    fn test_open_question_escalates() {
        let d = decide("Should the API use REST or gRPC?", &api_worker(), true);
        assert_eq!(d.rule, "fail_closed");
    }

    #[test]
    fn test_auto_approve_disabled_escalates_safe_rules() {
        let d = decide("Bash: cargo test\nProceed? (y/n)", &api_worker(), false);
        assert_eq!(d.rule, "test_run");
        assert_eq!(d.action, RuleAction::Escalate);
        assert!(d.reason.contains("disabled"));
    }

    #[test]
    fn test_class_precedence() {
        let prompt = detect_prompt("Bash: git add . && git commit\nProceed? (y/n)", 5).unwrap();
        let features = extract_features(&prompt, None);
        assert_eq!(ActionClass::classify(&prompt, &features), ActionClass::LocalCommit);
    }
}
