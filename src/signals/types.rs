//! Marker types a worker can emit in its output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fatal marker: the worker gave up.
///
/// Workers output `<worker-fatal>reason</worker-fatal>` on its own line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FatalSignal {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl FatalSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Markers extracted from one output snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSignals {
    /// `<worker-complete>` was seen
    pub complete: bool,
    /// Fatal markers found, in order
    pub fatal: Vec<FatalSignal>,
    /// Highest token count reported by `<tokens>N</tokens>` or a status line
    pub tokens: Option<u64>,
}

impl WorkerSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_signals(&self) -> bool {
        self.complete || !self.fatal.is_empty() || self.tokens.is_some()
    }

    /// The first fatal reason, if any. Fatal wins over completion.
    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.first().map(|f| f.reason.as_str())
    }

    /// Summary string for logging.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.complete {
            parts.push("complete".to_string());
        }
        if let Some(reason) = self.fatal_reason() {
            parts.push(format!("fatal: {reason}"));
        }
        if let Some(tokens) = self.tokens {
            parts.push(format!("{tokens} tokens"));
        }
        if parts.is_empty() {
            "no signals".to_string()
        } else {
            parts.join(", ")
        }
    }
}
