//! Tracing setup and log hygiene.
//!
//! `init` installs the global subscriber once per process. Oracle and model
//! output passes through [`sanitize_output`] before it is written to a run
//! log or embedded in a prompt, since terminal escape codes only waste
//! context and confuse the analysis model.

use anyhow::{Context, Result};
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Env var consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "GUIDEFORGE_LOG";

/// Install the global tracing subscriber.
///
/// Console output goes to stderr (human or JSON). When `log_dir` is given a
/// daily-rolling plain-text file is written there as well; keep the returned
/// guard alive for the life of the process or buffered lines are lost.
pub fn init(verbose: bool, json: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let (json_layer, text_layer) = if json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (
            None,
            Some(fmt::layer().with_target(false).with_writer(std::io::stderr)),
        )
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "guideforge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

static ESCAPE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // CSI sequences
        r"\x1B\[[0-?]*[ -/]*[@-~]",
        // OSC terminated by BEL
        r"\x1B\][^\x07]*\x07",
        // OSC 8 hyperlinks terminated by ST
        r"\x1B\]8;;.*?\x1B\\",
        // 7-bit C1 escapes
        r"\x1B[@-Z\\-_]",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Strip terminal escape sequences from captured process output.
pub fn sanitize_output(text: &str) -> String {
    let mut out = text.to_string();
    for pattern in ESCAPE_PATTERNS.iter() {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

/// Append sanitized `text` to a log file, ending with a newline.
///
/// Best effort: a failing run log must never fail the run itself.
pub fn append_log(log_path: &Path, text: &str) {
    let sanitized = sanitize_output(text);
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut f| {
            f.write_all(sanitized.as_bytes())?;
            if !sanitized.ends_with('\n') {
                f.write_all(b"\n")?;
            }
            Ok(())
        });
    if let Err(e) = result {
        tracing::debug!(path = %log_path.display(), error = %e, "Failed to append run log");
    }
}

/// Append each line of `content` prefixed with `[prefix]`.
pub fn append_log_block(log_path: &Path, prefix: &str, content: &str) {
    let block: String = sanitize_output(content)
        .lines()
        .map(|line| format!("[{}] {}\n", prefix, line))
        .collect();
    if !block.is_empty() {
        append_log(log_path, &block);
    }
}
