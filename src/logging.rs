//! tracing subscriber setup.
//!
//! Console output goes to stderr so command output on stdout stays
//! machine-readable. With file logging enabled, a daily-rotated JSON log is
//! written under `.foreman/logs` as well.

use crate::config::{LogFormat, LoggingSection};
use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber. The returned guard must be held until
/// exit or buffered file output is lost.
pub fn init(settings: &LoggingSection, verbose: bool, log_dir: &Path) -> Result<Option<WorkerGuard>> {
    let level = if verbose {
        Level::DEBUG
    } else {
        parse_log_level(&settings.level)?
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let console = match settings.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(true)
            .with_filter(env_filter.clone())
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(false)
            .with_filter(env_filter.clone())
            .boxed(),
    };

    if settings.file {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create {}", log_dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, "foreman.log"));
        let file = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter);

        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(console)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        Ok(None)
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.trim().to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!(
            "Invalid log level '{}'. Valid values: trace, debug, info, warn, error",
            other
        ),
    }
}
