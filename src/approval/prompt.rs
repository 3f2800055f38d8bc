//! Prompt detection and action classification.
//!
//! Detection looks only at the tail of a snapshot. Classification reads the
//! prompt together with a window of preceding lines and extracts the
//! features the rule table matches on. Lines below the prompt are status
//! output (spinners, timers, token counters) and are left out, except for a
//! menu's options.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Lines at the end of a snapshot searched for a confirmation marker.
const TAIL_LINES: usize = 6;

static YES_NO_PAREN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\((y/n|yes/no)\)").unwrap());

static YN_BRACKET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\[y/n\]").unwrap());

static MENU_YES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[^\w]*1[.)]\s*yes\b").unwrap());

static MENU_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\w]*\d+[.)]\s+\S").unwrap());

static DO_YOU_WANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(do you want to|would you like to|shall i|proceed)\b.*\?").unwrap());

static DESTRUCTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\brm\s|\brm$|\brmdir\b|\bdelet(e|es|ed|ing|ion)\b|\bremov(e|es|ing)\b|\bunlink\b|\bforced?\b|\breset\s+--hard\b|\bclean\s+-[a-z]*f|\bdrop\s+(?:[\w.-]+\s+){0,3}(table|database|schema|index|column)s?\b|\btruncate\b|\bwipe\b|\bpurge\b)",
    )
    .unwrap()
});

static CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\.env\b|\bsecrets?\b|\bpasswords?\b|\bpasswd\b|\bcredentials?\b|\bapi[_ -]?keys?\b|\baccess[_ -]?keys?\b|\bprivate[_ -]?keys?\b|\bauth[_ -]?token\b|\.pem\b|\bid_rsa\b|\bssh[_ -]key\b|\.npmrc\b|\.netrc\b)",
    )
    .unwrap()
});

static GIT_PUSH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgit[ \t]+push\b(?:[ \t]+-{1,2}[\w-]+)*(?:[ \t]+[\w.-]+)?(?:[ \t]+(?:[\w./-]+:)?([\w./-]+))?").unwrap());

static PUSH_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpush(?:es|ed|ing)?\b(?:[^\n?]*?)\bto\s+[`'\x22]?([\w./-]+)").unwrap());

static BARE_PUSH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bpush(es|ed|ing)?\b").unwrap());

static FILE_EDIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(edit|edits|write|writes|overwrite|create|creates|modify|modifies|update|updates|save|apply|make this edit|changes? to)\b",
    )
    .unwrap()
});

static TEST_RUN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(\bcargo\s+(test|nextest)\b|\b(npm|pnpm|yarn|bun)\s+(run\s+)?test\b|\bpytest\b|\bgo\s+test\b|\bjest\b|\bvitest\b|\bmake\s+(test|check)\b|\brun\s+(the\s+)?tests?\b|\bmix\s+test\b|\brspec\b)",
    )
    .unwrap()
});

static LOCAL_COMMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bgit\s+(add|commit)\b|\bcommit\s+(these|the|this|my|your)\s+changes?\b|\bcreate\s+a\s+commit\b)")
        .unwrap()
});

// Relative or absolute path with a file extension, or a path containing a slash
static PATH_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[\s'"`(\[:])((?:\.{0,2}/)?(?:[\w.-]+/)*[\w-][\w.-]*\.[A-Za-z][A-Za-z0-9]{0,7}|(?:\.{0,2}/)?(?:[\w.-]+/)+[\w.-]+/?)"#)
        .unwrap()
});

/// Shape of a detected prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// `(y/n)` or `(yes/no)`
    YesNo,
    /// `[Y/n]`
    Bracketed,
    /// Numbered menu whose first option is "Yes"
    Menu,
    /// "Do you want to ...?"
    Confirmation,
    /// Any other question; never auto-approved
    OpenQuestion,
}

impl PromptKind {
    pub fn is_binary(&self) -> bool {
        !matches!(self, PromptKind::OpenQuestion)
    }

    /// Keystrokes that answer "yes".
    pub fn affirmative_response(&self) -> Option<&'static str> {
        match self {
            PromptKind::YesNo => Some("y"),
            PromptKind::Bracketed => Some("y"),
            PromptKind::Menu => Some("1"),
            PromptKind::Confirmation => Some("y"),
            PromptKind::OpenQuestion => None,
        }
    }
}

/// A prompt found at the tail of a snapshot.
#[derive(Debug, Clone)]
pub struct DetectedPrompt {
    pub kind: PromptKind,
    /// The line carrying the question or marker
    pub prompt_line: String,
    /// Context window through the prompt line, then any menu options,
    /// oldest first
    pub context: Vec<String>,
}

impl DetectedPrompt {
    pub fn text(&self) -> String {
        self.context.join("\n")
    }
}

/// Find a prompt at the end of `snapshot`.
///
/// `context_lines` lines before the prompt are kept for classification.
pub fn detect_prompt(snapshot: &str, context_lines: usize) -> Option<DetectedPrompt> {
    let lines: Vec<&str> = snapshot.lines().collect();
    let last = lines.iter().rposition(|l| !l.trim().is_empty())?;
    let lines = &lines[..=last];

    let tail_start = lines.len().saturating_sub(TAIL_LINES);
    let mut found: Option<(usize, PromptKind)> = None;
    for (offset, line) in lines[tail_start..].iter().enumerate() {
        let index = tail_start + offset;
        let kind = if YES_NO_PAREN.is_match(line) {
            Some(PromptKind::YesNo)
        } else if YN_BRACKET.is_match(line) {
            Some(PromptKind::Bracketed)
        } else if MENU_YES.is_match(line) {
            Some(PromptKind::Menu)
        } else if DO_YOU_WANT.is_match(line) {
            Some(PromptKind::Confirmation)
        } else {
            None
        };
        if let Some(kind) = kind {
            found = match found {
                // A menu's question sits above its options
                Some((question, PromptKind::Confirmation)) if kind == PromptKind::Menu => {
                    Some((question, PromptKind::Menu))
                }
                _ => Some((index, kind)),
            };
        }
    }

    let (index, kind) = match found {
        Some(hit) => hit,
        None if lines[last].trim_end().ends_with('?') => (last, PromptKind::OpenQuestion),
        None => return None,
    };

    let start = index.saturating_sub(context_lines);
    let options = lines[index + 1..]
        .iter()
        .filter(|l| kind == PromptKind::Menu && MENU_OPTION.is_match(l));
    let context = lines[start..=index]
        .iter()
        .chain(options)
        .map(|l| l.trim_end().to_string())
        .collect();

    Some(DetectedPrompt {
        kind,
        prompt_line: lines[index].trim().to_string(),
        context,
    })
}

/// Features extracted from a prompt's context window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptFeatures {
    pub destructive: bool,
    pub credential: bool,
    pub push: bool,
    /// Push target, when one can be read
    pub push_target: Option<String>,
    pub file_edit: bool,
    /// Paths mentioned in the window, relative to the workspace when possible
    pub paths: Vec<PathBuf>,
    pub test_run: bool,
    pub local_commit: bool,
}

/// Extract features from `prompt`. Absolute paths under `workspace` are made
/// relative to it.
pub fn extract_features(prompt: &DetectedPrompt, workspace: Option<&Path>) -> PromptFeatures {
    let text = prompt.text();

    let push_target = GIT_PUSH
        .captures_iter(&text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .chain(
            PUSH_TO
                .captures_iter(&text)
                .filter_map(|c| c.get(1).map(|m| m.as_str().to_string())),
        )
        .next();

    PromptFeatures {
        destructive: DESTRUCTIVE.is_match(&text),
        credential: CREDENTIAL.is_match(&text),
        push: GIT_PUSH.is_match(&text) || BARE_PUSH.is_match(&text),
        push_target,
        file_edit: FILE_EDIT.is_match(&text),
        paths: extract_paths(&text, workspace),
        test_run: TEST_RUN.is_match(&text),
        local_commit: LOCAL_COMMIT.is_match(&text),
    }
}

fn extract_paths(text: &str, workspace: Option<&Path>) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for cap in PATH_TOKEN.captures_iter(text) {
        let Some(m) = cap.get(1) else { continue };
        let raw = m.as_str().trim_end_matches(['.', ':', ',']);
        if raw.is_empty()
            || raw.contains("://")
            || raw.starts_with("//")
            || raw.eq_ignore_ascii_case("y/n")
            || raw.eq_ignore_ascii_case("yes/no")
        {
            continue;
        }
        let mut path = PathBuf::from(raw.strip_prefix("./").unwrap_or(raw));
        if path.is_absolute()
            && let Some(root) = workspace
            && let Ok(relative) = path.strip_prefix(root)
        {
            path = relative.to_path_buf();
        }
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    paths
}

/// Fingerprint of a prompt instance: `<class>:<12 hex chars>` over the
/// whitespace-normalized prompt window. Output below the prompt does not
/// contribute, so a ticking status line keeps the same fingerprint.
pub fn fingerprint(class: &str, prompt: &DetectedPrompt) -> String {
    let normalized: Vec<String> = prompt
        .context
        .iter()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect();
    let digest = Sha256::digest(normalized.join("\n").as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{:02x}", b)).collect();
    format!("{class}:{hex}")
}
