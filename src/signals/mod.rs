//! Worker output markers.
//!
//! - `<worker-complete>` - the worker finished its task
//! - `<worker-fatal>reason</worker-fatal>` - the worker cannot continue
//! - `<tokens>N</tokens>` - token usage so far (an assistant status line
//!   such as `12.4k tokens` is read too)

mod parser;
mod types;

pub use parser::{SignalParser, extract_signals};
pub use types::{FatalSignal, WorkerSignals};

/// Completion marker text, as a worker should print it.
pub const COMPLETE_MARKER: &str = "<worker-complete>";

/// Build the fatal marker line for `reason`.
pub fn fatal_marker(reason: &str) -> String {
    format!("<worker-fatal>{reason}</worker-fatal>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_helpers_round_trip_through_parser() {
        assert!(extract_signals(COMPLETE_MARKER).complete);
        assert_eq!(
            extract_signals(&fatal_marker("no access")).fatal_reason(),
            Some("no access")
        );
    }
}
