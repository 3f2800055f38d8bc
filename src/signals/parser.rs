//! Marker parsing from worker output.
//!
//! Completion and fatal markers only count when they stand on their own
//! line (a leading bullet or prompt glyph is tolerated), so instructions
//! that mention the markers inline are not mistaken for them.

use super::types::{FatalSignal, WorkerSignals};
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static COMPLETE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[^\w<]*<worker-complete>\s*$").unwrap());

static FATAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[^\w<]*<worker-fatal>(.*?)</worker-fatal>\s*$").unwrap()
});

static TOKENS_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<tokens>\s*(\d+)\s*</tokens>").unwrap());

// Assistant status line, e.g. "↓ 12.4k tokens" or "3,210 tokens"
static TOKENS_STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*([km])?\s+tokens\b").unwrap()
});

/// Parser for extracting markers from a worker's output snapshot.
pub struct SignalParser {
    worker: String,
}

impl SignalParser {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    pub fn parse(&self, text: &str) -> WorkerSignals {
        let mut signals = WorkerSignals::new();

        signals.complete = COMPLETE_REGEX.is_match(text);

        for cap in FATAL_REGEX.captures_iter(text) {
            if let Some(reason) = cap.get(1) {
                let reason = reason.as_str().trim();
                let reason = if reason.is_empty() {
                    "worker reported a fatal error"
                } else {
                    reason
                };
                signals.fatal.push(FatalSignal::new(reason));
            }
        }

        let tagged = TOKENS_TAG_REGEX
            .captures_iter(text)
            .filter_map(|cap| cap.get(1)?.as_str().parse::<u64>().ok());
        let status = TOKENS_STATUS_REGEX
            .captures_iter(text)
            .filter_map(|cap| parse_token_count(cap.get(1)?.as_str(), cap.get(2).map(|m| m.as_str())));
        signals.tokens = tagged.chain(status).max();

        if signals.has_signals() {
            debug!(worker = %self.worker, signals = %signals.summary(), "Parsed worker markers");
        }

        signals
    }
}

fn parse_token_count(number: &str, suffix: Option<&str>) -> Option<u64> {
    let value: f64 = number.replace(',', "").parse().ok()?;
    let multiplier = match suffix.map(|s| s.to_ascii_lowercase()) {
        Some(s) if s == "k" => 1_000.0,
        Some(s) if s == "m" => 1_000_000.0,
        _ => 1.0,
    };
    Some((value * multiplier).round() as u64)
}

/// Extract markers without naming a worker.
pub fn extract_signals(text: &str) -> WorkerSignals {
    SignalParser::new("-").parse(text)
}
